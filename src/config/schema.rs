use crate::error::{LlamabarError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ServerConfig {
    /// Port the inference engine binds. The supervisor enforces a single
    /// active server regardless of the value here.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Explicit path to the llama-server binary. When unset, the bundled
    /// location and then $PATH are searched.
    pub engine_path: Option<PathBuf>,
    /// Engine log file. Defaults to `<data dir>/llamabar/server.log`.
    pub log_file: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct ModelsConfig {
    /// Where downloaded weights live. Defaults to `<data dir>/llamabar/models`.
    pub dir: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct CatalogConfig {
    /// Show catalog entries that do not fit this machine's memory.
    #[serde(default)]
    pub show_incompatible: bool,
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            engine_path: None,
            log_file: None,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            show_incompatible: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            models: ModelsConfig::default(),
            catalog: CatalogConfig::default(),
        }
    }
}

impl Config {
    /// Load config from the user config dir, falling back to defaults when
    /// the file does not exist. Partial files merge with defaults through
    /// serde's default attributes.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        toml::from_str(&content).map_err(|e| {
            LlamabarError::Config(format!("Failed to parse {}: {e}", path.display()))
        })
    }

    /// Resolve `$XDG_CONFIG_HOME/llamabar/config.toml` (or `~/.config/...`).
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(xdg_config)
        } else {
            let home = std::env::var("HOME")
                .map_err(|_| LlamabarError::Config("HOME env var not set".to_string()))?;
            PathBuf::from(home).join(".config")
        };

        Ok(config_dir.join("llamabar").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert!(config.server.engine_path.is_none());
        assert!(config.models.dir.is_none());
        assert!(!config.catalog.show_incompatible);
    }

    #[test]
    fn test_partial_config_merges_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [catalog]
            show_incompatible = true
            "#,
        )
        .unwrap();

        assert!(config.catalog.show_incompatible);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_server_section_overrides() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9090
            engine_path = "/opt/llama/bin/llama-server"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9090);
        assert_eq!(
            config.server.engine_path.as_deref(),
            Some(std::path::Path::new("/opt/llama/bin/llama-server"))
        );
    }

    #[test]
    fn test_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
    }
}
