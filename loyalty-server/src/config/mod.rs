//! Configuration module for loyalty-server.
//!
//! Handles loading configuration from an optional TOML file, then applying
//! command-line and environment overrides on top of it.

pub mod file;

use crate::config::file::FileConfig;
use loyalty_core::config::{DatabaseConfig, ReconcilerConfig};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("database URI not set (use -d or DATABASE_URI)")]
    MissingDatabaseUri,

    #[error("accrual system address not set (use -r or ACCRUAL_SYSTEM_ADDRESS)")]
    MissingAccrualAddress,

    #[error("invalid accrual system address {address:?}: {source}")]
    InvalidAccrualAddress {
        address: String,
        source: url::ParseError,
    },
}

/// Loaded configuration result containing all parts.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub database: DatabaseConfig,
    pub reconciler: ReconcilerConfig,
    pub log_json: bool,
}

/// Values given on the command line or through the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub database_uri: Option<String>,
    pub accrual_address: Option<String>,
}

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: std::path::PathBuf,
    overrides: Overrides,
}

impl ConfigLoader {
    pub fn new(config_path: impl AsRef<Path>, overrides: Overrides) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            overrides,
        }
    }

    /// Load and process the configuration.
    ///
    /// This will:
    /// 1. Read the TOML file, or use defaults if it does not exist
    /// 2. Apply command-line and environment overrides
    /// 3. Validate and build the runtime configuration
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let file_config = match std::fs::read_to_string(&self.config_path) {
            Ok(content) => toml::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => return Err(e.into()),
        };
        self.build(file_config)
    }

    fn build(&self, mut file_config: FileConfig) -> Result<LoadedConfig, ConfigError> {
        if let Some(uri) = &self.overrides.database_uri {
            file_config.database.url = Some(uri.clone());
        }
        if let Some(address) = &self.overrides.accrual_address {
            file_config.accrual.address = Some(address.clone());
        }

        Self::validate(&file_config)?;

        let database_url = file_config
            .database
            .url
            .filter(|u| !u.is_empty())
            .ok_or(ConfigError::MissingDatabaseUri)?;
        let address = file_config
            .accrual
            .address
            .clone()
            .filter(|a| !a.is_empty())
            .ok_or(ConfigError::MissingAccrualAddress)?;

        let accrual = &file_config.accrual;
        let reconciler = ReconcilerConfig {
            accrual_base_url: parse_accrual_address(&address)?,
            poll_interval: Duration::from_secs(accrual.poll_interval_secs),
            page_size: accrual.page_size,
            retry_budget: accrual.retry_budget,
            retry_delay: Duration::from_millis(accrual.retry_delay_ms),
            request_timeout: Duration::from_secs(accrual.request_timeout_secs),
        };

        Ok(LoadedConfig {
            database: DatabaseConfig {
                url: database_url,
                max_connections: file_config.database.max_connections,
            },
            reconciler,
            log_json: file_config.logging.json,
        })
    }

    fn validate(config: &FileConfig) -> Result<(), ConfigError> {
        let accrual = &config.accrual;
        if accrual.poll_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "accrual.poll_interval_secs must be positive".to_string(),
            ));
        }
        if accrual.page_size <= 0 {
            return Err(ConfigError::ValidationError(
                "accrual.page_size must be positive".to_string(),
            ));
        }
        if accrual.retry_budget == 0 {
            return Err(ConfigError::ValidationError(
                "accrual.retry_budget must be positive".to_string(),
            ));
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "database.max_connections must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Accept a bare `host:port` as well as a full URL.
pub fn parse_accrual_address(address: &str) -> Result<Url, ConfigError> {
    let candidate = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };
    Url::parse(&candidate).map_err(|source| ConfigError::InvalidAccrualAddress {
        address: address.to_string(),
        source,
    })
}
