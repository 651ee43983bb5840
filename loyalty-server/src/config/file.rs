//! TOML file configuration structures.
//!
//! These structs directly map to the `loyalty.toml` file format. Every
//! field has a default, so a missing file is the same as an empty one.

use serde::{Deserialize, Serialize};

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub database: DatabaseSection,
    pub accrual: AccrualSection,
    pub logging: LoggingSection,
}

/// Database configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// Postgres connection string. Usually supplied through `DATABASE_URI`.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// Accrual calculator and reconciliation loop section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccrualSection {
    /// Address of the accrual calculator. Usually supplied through
    /// `ACCRUAL_SYSTEM_ADDRESS`.
    pub address: Option<String>,
    pub poll_interval_secs: u64,
    pub page_size: i64,
    pub retry_budget: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for AccrualSection {
    fn default() -> Self {
        Self {
            address: None,
            poll_interval_secs: 10,
            page_size: 100,
            retry_budget: 5,
            retry_delay_ms: 1000,
            request_timeout_secs: 10,
        }
    }
}

/// Log output section. The filter itself comes from `RUST_LOG`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}
