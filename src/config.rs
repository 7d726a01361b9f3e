use crate::error::{AppError, Result};
use crate::messaging::BrokerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable naming an optional config file
pub const CONFIG_PATH_ENV: &str = "MAIL_RELAY_CONFIG";

/// Hosting-provider variable that overrides `broker.url`
pub const CLOUDAMQP_URL_ENV: &str = "CLOUDAMQP_URL";

const DEFAULT_CONFIG_PATH: &str = "config/mail-relay.toml";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Broker connection and queue
    #[serde(default)]
    pub broker: BrokerConfig,

    /// User and message storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging and metrics
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> std::result::Result<Self, config::ConfigError> {
        let config_path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&config_path, std::env::var(CLOUDAMQP_URL_ENV).ok())
    }

    /// Load with an explicit config file path and broker URL override
    pub fn load_from(
        config_path: &str,
        broker_url: Option<String>,
    ) -> std::result::Result<Self, config::ConfigError> {
        config::Config::builder()
            // Start with default values
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            // Override with config file if it exists
            .add_source(config::File::with_name(config_path).required(false))
            // Override with environment variables (prefix: MAIL_RELAY_)
            .add_source(
                config::Environment::with_prefix("MAIL_RELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("broker.url", broker_url.filter(|url| !url.is_empty()))?
            .build()?
            .try_deserialize()
    }

    /// Reject values that would only fail later at runtime
    pub fn validate(&self) -> Result<()> {
        self.broker.validate()?;
        if self.storage.users_file.as_os_str().is_empty() {
            return Err(AppError::Configuration(
                "storage.users_file must not be empty".to_string(),
            ));
        }
        if self.observability.metrics_port == Some(0) {
            return Err(AppError::Configuration(
                "observability.metrics_port must not be 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON array of `{id, name, email}` user records
    #[serde(default = "default_users_file")]
    pub users_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            users_file: default_users_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level, used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Port for the `/metrics` endpoint, disabled when unset
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            metrics_enabled: true,
            metrics_port: None,
        }
    }
}

fn default_users_file() -> PathBuf {
    PathBuf::from("kullanicilar.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}
