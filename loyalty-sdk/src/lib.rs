//! Wire types for the loyalty ledger.
//!
//! The core crate persists and reasons about these values; the services
//! around it (HTTP shell, accrual calculator) speak them on the wire.

pub mod objects;
