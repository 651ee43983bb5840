pub mod accrual;
pub mod orders;
pub mod wallet;

pub use accrual::{AccrualResponse, AccrualStatus};
pub use orders::OrderResponse;
pub use wallet::{BalanceResponse, WithdrawalRequest, WithdrawalResponse};

