//! Runtime configuration types.
//!
//! These are the validated values the core runs with. Loading them from a
//! file, flags or the environment is handled by the server crate.

use std::time::Duration;
use url::Url;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_PAGE_SIZE: i64 = 100;
pub const DEFAULT_RETRY_BUDGET: u32 = 5;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings of the accrual reconciliation loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Base address of the accrual calculator, e.g. `http://localhost:8081`.
    pub accrual_base_url: Url,
    /// Pause between two reconciliation cycles.
    pub poll_interval: Duration,
    /// Maximum number of orders polled per cycle.
    pub page_size: i64,
    /// Failed attempts allowed per order and cycle. Throttling and transport
    /// errors do not count.
    pub retry_budget: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
}

impl ReconcilerConfig {
    pub fn new(accrual_base_url: Url) -> Self {
        Self {
            accrual_base_url,
            poll_interval: DEFAULT_POLL_INTERVAL,
            page_size: DEFAULT_PAGE_SIZE,
            retry_budget: DEFAULT_RETRY_BUDGET,
            retry_delay: DEFAULT_RETRY_DELAY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Postgres connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
        }
    }
}
