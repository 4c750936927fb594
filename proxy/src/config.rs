//! Proxy configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Environment prefix, e.g. `RPCPROF_PROXY_ENDPOINT=unix:///run/app/pprof.sock`.
pub const ENV_PREFIX: &str = "RPCPROF_PROXY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// HTTP listen address
    pub listen_addr: String,

    /// gRPC service address: `unix://path`, `host:port` or an http(s) URL
    pub endpoint: String,

    /// Requests under this prefix are forwarded
    pub path_prefix: String,

    /// Capture length when `seconds` is missing, zero or not a number
    pub default_capture_secs: i64,

    /// Slack on top of the requested capture length before a stalled capture
    /// response is aborted
    pub capture_grace_secs: u64,

    pub connect_timeout_secs: u64,

    /// Bearer token sent to the gRPC service
    pub auth_token: Option<String>,

    /// Gzip request messages. Only for services that accept gzip; responses
    /// are decompressed either way.
    pub compress_requests: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            endpoint: "unix://pprof.sock".to_string(),
            path_prefix: "/debug/pprof/".to_string(),
            default_capture_secs: 30,
            capture_grace_secs: 10,
            connect_timeout_secs: 5,
            auth_token: None,
            compress_requests: false,
        }
    }
}

impl ProxyConfig {
    /// Defaults, then `file`, then `RPCPROF_PROXY_*` variables.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        rpcprof_shared::config::load(file, ENV_PREFIX)
    }

    pub fn listen_socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.listen_addr))
    }

    pub fn capture_grace(&self) -> Duration {
        Duration::from_secs(self.capture_grace_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen_socket_addr().unwrap(), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.endpoint, "unix://pprof.sock");
        assert_eq!(config.path_prefix, "/debug/pprof/");
        assert_eq!(config.default_capture_secs, 30);
        assert_eq!(config.capture_grace(), Duration::from_secs(10));
        assert!(!config.compress_requests);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "endpoint = \"127.0.0.1:50051\"").unwrap();
        writeln!(file, "default_capture_secs = 5").unwrap();
        writeln!(file, "auth_token = \"s3cret\"").unwrap();
        writeln!(file, "compress_requests = true").unwrap();

        let config = ProxyConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.endpoint, "127.0.0.1:50051");
        assert_eq!(config.default_capture_secs, 5);
        assert_eq!(config.auth_token.as_deref(), Some("s3cret"));
        assert!(config.compress_requests);
        assert_eq!(config.listen_addr, "127.0.0.1:8080");
    }
}
