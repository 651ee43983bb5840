pub mod accruals;
pub mod orders;
pub mod wallet_events;

pub use accruals::{AccrualRecord, AccrualRepository};
pub use orders::{
    InvalidOrderNumber, Order, OrderError, OrderNumber, OrderRepository, OrderState,
    is_valid_order_number,
};
pub use wallet_events::{WalletEventRecord, WithdrawalProjection};
