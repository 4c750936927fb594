//! Layered configuration loading
//!
//! Values come from, in increasing priority: the type's `Default`, an optional
//! TOML file, and environment variables carrying a prefix
//! (`RPCPROF_PROXY_LISTEN_ADDR` sets `listen_addr` for prefix `RPCPROF_PROXY`).
//! Command-line flags are applied on top by the binaries.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::de::DeserializeOwned;
use std::path::Path;

/// Load a configuration struct. `T` should be `#[serde(default)]` so that
/// every layer may be partial.
pub fn load<T: DeserializeOwned>(file: Option<&Path>, env_prefix: &str) -> Result<T> {
    let mut builder = Config::builder();

    if let Some(path) = file {
        tracing::debug!(path = %path.display(), "loading configuration file");
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
    }

    builder
        .add_source(Environment::with_prefix(env_prefix).try_parsing(true))
        .build()
        .context("Failed to assemble configuration")?
        .try_deserialize()
        .context("Invalid configuration")
}
