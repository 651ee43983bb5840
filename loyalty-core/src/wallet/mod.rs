//! Customer wallets: the event-sourced aggregate and its store.

pub mod aggregate;
pub mod store;

pub use aggregate::{Wallet, WalletCommand, WalletError, WalletEvent};
pub use store::{PgWalletEventStore, WalletEventStore, WalletStoreError, check_expected_version};
