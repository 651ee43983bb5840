use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::AccrualStatus;

/// One order as shown to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderResponse {
    pub number: String,
    pub status: AccrualStatus,
    /// Latest accrual awarded for the order, if the calculator has answered.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub accrual: Option<Decimal>,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded_at: time::OffsetDateTime,
}
