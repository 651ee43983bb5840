//! Background processors and event subscribers.
//!
//! - `AccrualReconciler`: polls the accrual calculator, emits `accrual.created`
//! - `OrderStateUpdater`: receives `accrual.created`, advances the order
//! - `WalletCreditor`: receives `accrual.created`, credits `PROCESSED` awards
//! - `WalletOpener`: receives `user.registered`, opens the wallet

pub mod accrual_source;
pub mod handlers;
pub mod reconciler;

pub use accrual_source::{AccrualPoll, AccrualSource, HttpAccrualSource, SourceError};
pub use handlers::{OrderStateUpdater, WalletCreditor, WalletOpener, register_event_handlers};
pub use reconciler::{AccrualReconciler, CycleReport, PollOutcome};
