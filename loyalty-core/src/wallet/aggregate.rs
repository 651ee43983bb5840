//! Event-sourced wallet of a single customer.
//!
//! Commands are validated against the current state and turned into events;
//! state only changes by applying events, so balance and withdrawn are
//! always the fold of the history.

use crate::entities::orders::is_valid_order_number;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub const EVENT_CREATED: &str = "created";
pub const EVENT_DEPOSITED: &str = "deposited";
pub const EVENT_WITHDRAWN: &str = "withdrawn";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Created {
    #[serde(rename = "customerID")]
    pub customer_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deposited {
    #[serde(rename = "customerID")]
    pub customer_id: String,
    pub amount: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Withdrawn {
    #[serde(rename = "customerID")]
    pub customer_id: String,
    pub amount: Decimal,
    pub order_number: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Everything that can happen to a wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    Created(Created),
    Deposited(Deposited),
    Withdrawn(Withdrawn),
}

impl WalletEvent {
    /// Tag stored in `wallet_events.event_type`.
    pub fn event_type(&self) -> &'static str {
        match self {
            WalletEvent::Created(_) => EVENT_CREATED,
            WalletEvent::Deposited(_) => EVENT_DEPOSITED,
            WalletEvent::Withdrawn(_) => EVENT_WITHDRAWN,
        }
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        match self {
            WalletEvent::Created(e) => e.timestamp,
            WalletEvent::Deposited(e) => e.timestamp,
            WalletEvent::Withdrawn(e) => e.timestamp,
        }
    }

    pub fn to_data(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            WalletEvent::Created(e) => serde_json::to_value(e),
            WalletEvent::Deposited(e) => serde_json::to_value(e),
            WalletEvent::Withdrawn(e) => serde_json::to_value(e),
        }
    }

    /// Decode a stored event by its tag. `Ok(None)` means the tag is unknown.
    pub fn from_stored(
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<Option<Self>, serde_json::Error> {
        let event = match event_type {
            EVENT_CREATED => WalletEvent::Created(serde_json::from_value(data)?),
            EVENT_DEPOSITED => WalletEvent::Deposited(serde_json::from_value(data)?),
            EVENT_WITHDRAWN => WalletEvent::Withdrawn(serde_json::from_value(data)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletCommand {
    Create,
    Deposit { amount: Decimal },
    Withdraw { order_number: String, amount: Decimal },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalletError {
    #[error("wallet has not been opened")]
    NotOpened,

    #[error("wallet already exists")]
    AlreadyExists,

    #[error("invalid order number: {0:?}")]
    InvalidOrderNumber(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(Decimal),

    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: Decimal, requested: Decimal },
}

#[derive(Debug, Clone)]
pub struct Wallet {
    pub customer_id: String,
    balance: Decimal,
    withdrawn: Decimal,
    version: i64,
    opened: bool,
    pending: Vec<WalletEvent>,
}

impl Wallet {
    /// A wallet with no history. It must be created before it accepts money.
    pub fn new(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            balance: Decimal::ZERO,
            withdrawn: Decimal::ZERO,
            version: 0,
            opened: false,
            pending: Vec::new(),
        }
    }

    /// Rebuild from stored history. The pending buffer ends up empty.
    pub fn replay(
        customer_id: impl Into<String>,
        history: impl IntoIterator<Item = WalletEvent>,
    ) -> Self {
        let mut wallet = Self::new(customer_id);
        for event in history {
            wallet.apply(event);
        }
        wallet.clear_pending();
        wallet
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn withdrawn(&self) -> Decimal {
        self.withdrawn
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn is_opened(&self) -> bool {
        self.opened
    }

    pub fn pending_events(&self) -> &[WalletEvent] {
        &self.pending
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Version the store must hold for the pending events to apply cleanly.
    pub fn base_version(&self) -> i64 {
        self.version - self.pending.len() as i64
    }

    /// Validate `command`, then apply and buffer the resulting event.
    pub fn handle(&mut self, command: WalletCommand) -> Result<WalletEvent, WalletError> {
        let now = OffsetDateTime::now_utc();
        let event = match command {
            WalletCommand::Create => {
                if self.opened {
                    return Err(WalletError::AlreadyExists);
                }
                WalletEvent::Created(Created {
                    customer_id: self.customer_id.clone(),
                    timestamp: now,
                })
            }
            WalletCommand::Deposit { amount } => {
                if !self.opened {
                    return Err(WalletError::NotOpened);
                }
                if amount < Decimal::ZERO {
                    return Err(WalletError::InvalidAmount(amount));
                }
                WalletEvent::Deposited(Deposited {
                    customer_id: self.customer_id.clone(),
                    amount,
                    timestamp: now,
                })
            }
            WalletCommand::Withdraw {
                order_number,
                amount,
            } => {
                if !self.opened {
                    return Err(WalletError::NotOpened);
                }
                if !is_valid_order_number(&order_number) {
                    return Err(WalletError::InvalidOrderNumber(order_number));
                }
                if amount <= Decimal::ZERO {
                    return Err(WalletError::InvalidAmount(amount));
                }
                if self.balance < amount {
                    return Err(WalletError::InsufficientFunds {
                        balance: self.balance,
                        requested: amount,
                    });
                }
                WalletEvent::Withdrawn(Withdrawn {
                    customer_id: self.customer_id.clone(),
                    amount,
                    order_number,
                    timestamp: now,
                })
            }
        };
        self.apply(event.clone());
        Ok(event)
    }

    /// Fold one event into the state and buffer it.
    pub fn apply(&mut self, event: WalletEvent) {
        match &event {
            WalletEvent::Created(_) => {
                self.opened = true;
            }
            WalletEvent::Deposited(e) => {
                self.balance += e.amount;
            }
            WalletEvent::Withdrawn(e) => {
                self.balance -= e.amount;
                self.withdrawn += e.amount;
            }
        }
        self.version += 1;
        self.pending.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened(customer: &str) -> Wallet {
        let mut wallet = Wallet::new(customer);
        wallet.handle(WalletCommand::Create).unwrap();
        wallet
    }

    #[test]
    fn test_create_twice_fails() {
        let mut wallet = opened("alice");
        assert_eq!(
            wallet.handle(WalletCommand::Create).unwrap_err(),
            WalletError::AlreadyExists
        );
        assert_eq!(wallet.version(), 1);
        assert_eq!(wallet.pending_events().len(), 1);
    }

    #[test]
    fn test_money_requires_open_wallet() {
        let mut wallet = Wallet::new("alice");
        assert_eq!(
            wallet
                .handle(WalletCommand::Deposit {
                    amount: Decimal::from(10)
                })
                .unwrap_err(),
            WalletError::NotOpened
        );
        assert_eq!(wallet.version(), 0);
    }

    #[test]
    fn test_balance_is_fold_of_events() {
        let mut wallet = opened("alice");
        wallet
            .handle(WalletCommand::Deposit {
                amount: Decimal::new(5005, 1),
            })
            .unwrap();
        wallet
            .handle(WalletCommand::Deposit {
                amount: Decimal::ZERO,
            })
            .unwrap();
        wallet
            .handle(WalletCommand::Withdraw {
                order_number: "79927398713".to_string(),
                amount: Decimal::new(1005, 1),
            })
            .unwrap();

        assert_eq!(wallet.balance(), Decimal::from(400));
        assert_eq!(wallet.withdrawn(), Decimal::new(1005, 1));
        assert_eq!(wallet.version(), 4);

        let replayed = Wallet::replay("alice", wallet.pending_events().to_vec());
        assert_eq!(replayed.balance(), wallet.balance());
        assert_eq!(replayed.withdrawn(), wallet.withdrawn());
        assert_eq!(replayed.version(), wallet.version());
        assert!(replayed.pending_events().is_empty());
        assert_eq!(replayed.base_version(), 4);
    }

    #[test]
    fn test_insufficient_funds_leaves_state_untouched() {
        let mut wallet = opened("alice");
        wallet
            .handle(WalletCommand::Deposit {
                amount: Decimal::from(100),
            })
            .unwrap();
        let err = wallet
            .handle(WalletCommand::Withdraw {
                order_number: "12345678903".to_string(),
                amount: Decimal::from(150),
            })
            .unwrap_err();
        assert_eq!(
            err,
            WalletError::InsufficientFunds {
                balance: Decimal::from(100),
                requested: Decimal::from(150),
            }
        );
        assert_eq!(wallet.balance(), Decimal::from(100));
        assert_eq!(wallet.version(), 2);
    }

    #[test]
    fn test_withdraw_validation() {
        let mut wallet = opened("alice");
        wallet
            .handle(WalletCommand::Deposit {
                amount: Decimal::from(100),
            })
            .unwrap();
        assert!(matches!(
            wallet.handle(WalletCommand::Withdraw {
                order_number: "79927398710".to_string(),
                amount: Decimal::from(1),
            }),
            Err(WalletError::InvalidOrderNumber(_))
        ));
        assert!(matches!(
            wallet.handle(WalletCommand::Withdraw {
                order_number: "79927398713".to_string(),
                amount: Decimal::ZERO,
            }),
            Err(WalletError::InvalidAmount(_))
        ));
        assert!(matches!(
            wallet.handle(WalletCommand::Deposit {
                amount: Decimal::from(-5),
            }),
            Err(WalletError::InvalidAmount(_))
        ));
        assert_eq!(wallet.balance(), Decimal::from(100));
    }

    #[test]
    fn test_stored_event_roundtrip_by_tag() {
        let mut wallet = opened("alice");
        let event = wallet
            .handle(WalletCommand::Deposit {
                amount: Decimal::from(42),
            })
            .unwrap();
        let data = event.to_data().unwrap();
        assert_eq!(data["customerID"], "alice");
        let decoded = WalletEvent::from_stored(event.event_type(), data).unwrap();
        assert_eq!(decoded, Some(event));
        assert_eq!(
            WalletEvent::from_stored("frozen", serde_json::json!({})).unwrap(),
            None
        );
    }
}
