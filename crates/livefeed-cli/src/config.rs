//! Configuration management for the livefeed CLI
//!
//! Settings resolve in this order: command-line flag, environment variable,
//! config file (`~/.livefeed/config.toml`), built-in default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Database address (`host:port`, or a full ws/http URL)
    pub address: String,

    /// Login user sent in the auth message
    pub user: Option<String>,

    /// Use TLS for bare `host:port` addresses
    pub secure: bool,

    /// Default output format
    pub output_format: OutputFormat,

    /// Enable colored output
    pub colored: bool,

    /// Reconnection attempts before giving up
    pub max_attempts: u32,

    /// First retry delay in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound on a retry delay in milliseconds
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "localhost:6876".to_string(),
            user: None,
            secure: false,
            output_format: OutputFormat::Table,
            colored: true,
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl Config {
    /// Load config from `path`, falling back to defaults when it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Save config to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(())
    }

    /// Default config file path (~/.livefeed/config.toml)
    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".livefeed").join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.address, "localhost:6876");
        assert_eq!(config.output_format, OutputFormat::Table);
        assert_eq!(config.max_attempts, 5);
        assert!(config.colored);
        assert!(!config.secure);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let toml_str = r#"
            address = "mz.internal:443"
            secure = true
            output_format = "json"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.address, "mz.internal:443");
        assert!(config.secure);
        assert_eq!(config.output_format, OutputFormat::Json);
        assert_eq!(config.base_delay_ms, 1_000);
        assert!(config.user.is_none());
    }

    #[test]
    fn test_unknown_format_rejected() {
        let toml_str = r#"output_format = "csv""#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    #[test]
    fn test_missing_file_is_default() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let config = Config {
            address: "db:6876".to_string(),
            user: Some("materialize".to_string()),
            output_format: OutputFormat::Yaml,
            colored: false,
            ..Config::default()
        };
        config.save_to(&config_path).unwrap();

        let loaded = Config::load_from(&config_path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_malformed_file_reports_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(&config_path, "address = [").unwrap();

        let err = Config::load_from(&config_path).unwrap_err();
        assert!(format!("{err:#}").contains("config.toml"));
    }
}
