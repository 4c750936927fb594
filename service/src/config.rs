//! Server configuration

use crate::diagnostics::SamplerConfig;
use anyhow::{Context, Result};
use rpcprof_shared::utils::unix_socket_path;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment prefix, e.g. `RPCPROF_SERVER_LISTEN=0.0.0.0:50051`.
pub const ENV_PREFIX: &str = "RPCPROF_SERVER";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// gRPC listen address: `host:port` or `unix://path`
    pub listen: String,

    /// Admin HTTP listen address (health checks + metrics); disabled when unset
    pub admin_addr: Option<String>,

    /// Optional bearer token for gRPC authentication
    pub auth_token: Option<String>,

    /// How often captures sample /proc
    pub sample_interval_ms: u64,

    /// How often captures push buffered output to the client
    pub flush_interval_ms: u64,

    /// Max gRPC message size in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "unix://pprof.sock".to_string(),
            admin_addr: None,
            auth_token: None,
            sample_interval_ms: 10,
            flush_interval_ms: 1000,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// Where the gRPC server accepts connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenTarget {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl ServerConfig {
    /// Defaults, then `file`, then `RPCPROF_SERVER_*` variables.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        rpcprof_shared::config::load(file, ENV_PREFIX)
    }

    pub fn listen_target(&self) -> Result<ListenTarget> {
        if let Some(path) = unix_socket_path(&self.listen) {
            return Ok(ListenTarget::Unix(PathBuf::from(path)));
        }
        self.listen
            .parse()
            .map(ListenTarget::Tcp)
            .with_context(|| format!("Invalid listen address: {}", self.listen))
    }

    pub fn admin_socket_addr(&self) -> Result<Option<SocketAddr>> {
        self.admin_addr
            .as_deref()
            .filter(|a| !a.is_empty())
            .map(|a| a.parse().with_context(|| format!("Invalid admin address: {}", a)))
            .transpose()
    }

    pub fn sampler(&self) -> SamplerConfig {
        SamplerConfig {
            sample_interval: Duration::from_millis(self.sample_interval_ms.max(1)),
            flush_interval: Duration::from_millis(self.flush_interval_ms.max(1)),
        }
    }
}
