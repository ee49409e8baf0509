//! Configuration loading and management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub uploads: UploadsConfig,
    #[serde(default)]
    pub deletes: DeletesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Refuse every mutating endpoint
    #[serde(default)]
    pub read_only: bool,
    /// Registry-as-cache deployments refuse mutations the same way
    #[serde(default)]
    pub mirror_mode: bool,
    /// Secret key signing resumable upload-state tokens
    #[serde(default = "default_secret")]
    pub secret: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            read_only: false,
            mirror_mode: false,
            secret: default_secret(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Trusted backends skip digest re-verification on blob reads
    #[serde(default = "default_trusted")]
    pub trusted: bool,
    #[serde(default)]
    pub local: LocalStorageConfig,
    #[serde(default)]
    pub s3: S3StorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            trusted: default_trusted(),
            local: LocalStorageConfig::default(),
            s3: S3StorageConfig::default(),
        }
    }
}

/// Local storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    #[serde(default = "default_local_path")]
    pub path: String,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            path: default_local_path(),
        }
    }
}

/// S3 storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct S3StorageConfig {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub prefix: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
}

/// Upload session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadsConfig {
    /// Sessions older than this are eligible for cleanup
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: i64,
    /// How often the expiry sweeper runs
    #[serde(default = "default_sweep_interval_hours")]
    pub sweep_interval_hours: u64,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            session_ttl_hours: default_session_ttl_hours(),
            sweep_interval_hours: default_sweep_interval_hours(),
        }
    }
}

/// Deletion configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeletesConfig {
    /// Blob and manifest deletion is disabled unless opted in
    #[serde(default)]
    pub enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: "pretty".to_string(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

pub fn default_secret() -> String {
    "change-me-in-production".to_string()
}

fn default_backend() -> String {
    "local".to_string()
}

fn default_trusted() -> bool {
    true
}

fn default_local_path() -> String {
    "./data/registry".to_string()
}

fn default_session_ttl_hours() -> i64 {
    168 // 7 days
}

fn default_sweep_interval_hours() -> u64 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &str) -> Result<Self> {
        let config_path = Path::new(path);

        if !config_path.exists() {
            info!("Config file not found at {}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        info!("Loaded configuration from {}", path);
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            uploads: UploadsConfig::default(),
            deletes: DeletesConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.storage.backend, "local");
        assert!(config.storage.trusted);
        assert!(!config.deletes.enabled);
        assert_eq!(config.uploads.session_ttl_hours, 168);
    }

    #[test]
    fn test_parse_partial_config() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 8080
            read_only = true

            [storage]
            backend = "s3"
            trusted = false

            [storage.s3]
            bucket = "images"
            region = "eu-west-1"

            [deletes]
            enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert!(config.server.read_only);
        assert_eq!(config.storage.backend, "s3");
        assert!(!config.storage.trusted);
        assert_eq!(config.storage.s3.bucket.as_deref(), Some("images"));
        assert!(config.deletes.enabled);
        // Untouched sections keep their defaults
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.uploads.sweep_interval_hours, 1);
    }
}
