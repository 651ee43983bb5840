//! Application services shared by the reconciler, the event handlers and the
//! outer shell.

mod orders;
mod wallet;

pub use orders::OrderService;
pub use wallet::{WalletService, WalletServiceError};
