//! In-process publish/subscribe of domain events.
//!
//! # Event Flow
//!
//! 1. `AccrualReconciler` stores a verdict and publishes `accrual.created`
//! 2. `OrderStateUpdater` advances the order
//! 3. `WalletCreditor` deposits the award for `PROCESSED` verdicts
//!
//! `user.registered`, published by the outer shell, opens the wallet.
//!
//! Delivery is at most once: handler failures are logged and reported to the
//! bus failure hook, never retried.

pub mod bus;
pub mod types;

pub use bus::{Dispatch, EventBus, EventHandler, FailureHook, HandlerError, HandlerFailure};
pub use types::{ACCRUAL_CREATED, AccrualCreated, DomainEvent, USER_REGISTERED, UserRegistered};
