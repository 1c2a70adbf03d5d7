//! Configuration loading for the daemon.
//!
//! The config file path comes from `ERU_CONFIG` (default `eru.toml`).
//! A missing file yields the built-in defaults so dev mode needs no
//! setup; a present but malformed file is an error.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use eru_types::Config;

/// Load configuration from the environment-selected TOML file.
pub fn load() -> Result<Config> {
    let path = std::env::var("ERU_CONFIG").unwrap_or_else(|_| "eru.toml".to_string());
    from_file(Path::new(&path))
}

/// Load configuration from a specific TOML file.
pub fn from_file(path: &Path) -> Result<Config> {
    if !path.exists() {
        info!(?path, "config file absent, using defaults");
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: Config =
        toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}
