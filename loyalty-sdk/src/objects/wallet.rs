//! Wallet read models and the withdrawal request.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Current balance and lifetime withdrawals of a customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceResponse {
    #[serde(with = "rust_decimal::serde::float")]
    pub current: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub withdrawn: Decimal,
}

/// Spend `sum` points against order `order`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub order: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub sum: Decimal,
}

/// One entry of the withdrawal history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalResponse {
    pub order: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub sum: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub processed_at: time::OffsetDateTime,
}
