//! Configuration loading and validation
//!
//! Reads TOML from `~/.config/llamabar/config.toml`. Every field has a
//! default, so a missing or partial file is never an error.

mod schema;

pub use schema::{CatalogConfig, Config, ModelsConfig, ServerConfig};

use crate::error::Result;
use std::path::PathBuf;

/// Application data dir, `$XDG_DATA_HOME/llamabar` or `~/.local/share/llamabar`
/// on Linux, `~/Library/Application Support/llamabar` on macOS.
pub fn data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().ok_or_else(|| {
        crate::error::LlamabarError::Config("Could not determine data directory".to_string())
    })?;
    Ok(base.join("llamabar"))
}

/// Directory holding downloaded model weights, honoring the config override.
pub fn models_dir(config: &Config) -> Result<PathBuf> {
    match &config.models.dir {
        Some(dir) => Ok(dir.clone()),
        None => Ok(data_dir()?.join("models")),
    }
}

/// Engine log file path, honoring the config override.
pub fn server_log_path(config: &Config) -> Result<PathBuf> {
    match &config.server.log_file {
        Some(path) => Ok(path.clone()),
        None => Ok(data_dir()?.join("server.log")),
    }
}
