//! Domain events crossing aggregate boundaries.
//!
//! Unlike wallet events these are not persisted; they carry enough data for
//! subscribers to act without another lookup.

use loyalty_sdk::objects::AccrualStatus;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const ACCRUAL_CREATED: &str = "accrual.created";
pub const USER_REGISTERED: &str = "user.registered";

/// An accrual verdict was stored for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccrualCreated {
    pub order_number: String,
    pub amount: Decimal,
    pub status: AccrualStatus,
    #[serde(rename = "customerID")]
    pub customer_id: String,
}

/// A customer account was created by the outer shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRegistered {
    #[serde(rename = "userID")]
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    AccrualCreated(AccrualCreated),
    UserRegistered(UserRegistered),
}

impl DomainEvent {
    /// Name subscribers register under.
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::AccrualCreated(_) => ACCRUAL_CREATED,
            DomainEvent::UserRegistered(_) => USER_REGISTERED,
        }
    }
}

impl From<AccrualCreated> for DomainEvent {
    fn from(value: AccrualCreated) -> Self {
        DomainEvent::AccrualCreated(value)
    }
}

impl From<UserRegistered> for DomainEvent {
    fn from(value: UserRegistered) -> Self {
        DomainEvent::UserRegistered(value)
    }
}
