//! The accrual calculator's polling contract.
//!
//! `GET {base}/api/orders/{number}` answers `200` with an [`AccrualResponse`],
//! `429` with an optional `Retry-After` header, or anything else on failure.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Verdict of the accrual calculator for one order.
///
/// Orders carry the same four states, so this enum is shared by both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccrualStatus {
    New,
    Processing,
    Invalid,
    Processed,
}

impl AccrualStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AccrualStatus::New => "NEW",
            AccrualStatus::Processing => "PROCESSING",
            AccrualStatus::Invalid => "INVALID",
            AccrualStatus::Processed => "PROCESSED",
        }
    }
}

impl std::fmt::Display for AccrualStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a successful poll.
///
/// `accrual` is omitted by the calculator for orders that earned nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccrualResponse {
    pub order: String,
    pub status: AccrualStatus,
    #[serde(default, with = "rust_decimal::serde::float")]
    pub accrual: Decimal,
}
