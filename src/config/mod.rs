//! Client configuration.
//!
//! Aggregates the connection, listing and web sections into a single Config
//! struct that can be loaded from YAML files or environment variables.

mod client;

pub use client::{ConnectionConfig, ListingConfig, WebConfig, DEFAULT_HOST, DEFAULT_PORT};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "tio.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "TIO_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "TIO";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "TIO_LOG";

use serde::Deserialize;

use crate::error::{ClientError, Result};

/// Main client configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// PR1 server connection.
    pub connection: ConnectionConfig,
    /// Background listing cadence.
    pub listing: ListingConfig,
    /// HTTP/JSON binding (optional).
    pub web: Option<WebConfig>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `tio.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, e.g.
    ///    `TIO__CONNECTION__PORT=2606`
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Parse a YAML document directly.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            ClientError::Config(::config::ConfigError::Message(format!(
                "invalid yaml: {}",
                e
            )))
        })
    }
}
