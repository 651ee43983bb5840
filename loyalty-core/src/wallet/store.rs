//! Persistence of wallet event streams with optimistic concurrency.

use super::aggregate::{Wallet, WalletEvent};
use crate::entities::wallet_events::{
    CountWalletEvents, GetWalletEvents, GetWithdrawals, WalletEventRecord, WithdrawalProjection,
};
use crate::framework::DatabaseProcessor;
use async_trait::async_trait;
use kanau::processor::Processor;
use sqlx::types::Json;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WalletStoreError {
    /// Another writer appended to the stream since the wallet was loaded.
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: i64, actual: i64 },

    #[error("unknown wallet event type: {0}")]
    UnknownEventType(String),

    #[error("failed to encode or decode event data: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// The stream must still end at the version the wallet was loaded at.
pub fn check_expected_version(stored_max: i64, wallet: &Wallet) -> Result<(), WalletStoreError> {
    let expected = wallet.base_version();
    if stored_max != expected {
        return Err(WalletStoreError::VersionConflict {
            expected,
            actual: stored_max,
        });
    }
    Ok(())
}

#[async_trait]
pub trait WalletEventStore: Send + Sync {
    /// Rebuild a wallet from its stream. No events yields an unopened wallet at version 0.
    async fn load(&self, customer_id: &str) -> Result<Wallet, WalletStoreError>;

    /// Append the wallet's pending events atomically, then clear them.
    async fn store(&self, wallet: &mut Wallet) -> Result<(), WalletStoreError>;

    async fn exists(&self, customer_id: &str) -> Result<bool, WalletStoreError>;

    /// Withdrawals of a customer, most recent first.
    async fn withdrawals(
        &self,
        customer_id: &str,
    ) -> Result<Vec<WithdrawalProjection>, WalletStoreError>;
}

/// Fold stored records, already ordered by version, into a wallet.
pub(crate) fn decode_history(
    customer_id: &str,
    records: Vec<WalletEventRecord>,
) -> Result<Wallet, WalletStoreError> {
    let mut events = Vec::with_capacity(records.len());
    for record in records {
        let Json(data) = record.event_data;
        match WalletEvent::from_stored(&record.event_type, data)? {
            Some(event) => events.push(event),
            None => return Err(WalletStoreError::UnknownEventType(record.event_type)),
        }
    }
    Ok(Wallet::replay(customer_id, events))
}

/// Rows to write for the wallet's pending events, numbered after `stored_max`.
pub(crate) fn encode_pending(
    wallet: &Wallet,
    stored_max: i64,
) -> Result<Vec<(WalletEventRecord, Option<WithdrawalProjection>)>, WalletStoreError> {
    let mut rows = Vec::with_capacity(wallet.pending_events().len());
    for (offset, event) in wallet.pending_events().iter().enumerate() {
        let record = WalletEventRecord {
            event_id: Uuid::now_v7(),
            aggregate_id: wallet.customer_id.clone(),
            event_type: event.event_type().to_string(),
            event_data: Json(event.to_data()?),
            version: stored_max + offset as i64 + 1,
            timestamp: event.timestamp(),
        };
        let projection = match event {
            WalletEvent::Withdrawn(w) => Some(WithdrawalProjection {
                id: Uuid::now_v7(),
                event_id: record.event_id,
                customer_id: w.customer_id.clone(),
                amount: w.amount,
                order_number: w.order_number.clone(),
                timestamp: w.timestamp,
            }),
            WalletEvent::Created(_) | WalletEvent::Deposited(_) => None,
        };
        rows.push((record, projection));
    }
    Ok(rows)
}

pub struct PgWalletEventStore {
    db: DatabaseProcessor,
}

impl PgWalletEventStore {
    pub fn new(db: DatabaseProcessor) -> Self {
        Self { db }
    }
}

/// Whether an insert lost the race for `(aggregate_id, version)` to a
/// concurrent writer.
fn is_duplicate_version(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|e| e.is_unique_violation())
}

fn conflict_on_duplicate(err: sqlx::Error, expected: i64, version: i64) -> WalletStoreError {
    if is_duplicate_version(&err) {
        WalletStoreError::VersionConflict {
            expected,
            actual: version,
        }
    } else {
        WalletStoreError::Database(err)
    }
}

#[async_trait]
impl WalletEventStore for PgWalletEventStore {
    async fn load(&self, customer_id: &str) -> Result<Wallet, WalletStoreError> {
        let records = self
            .db
            .process(GetWalletEvents {
                aggregate_id: customer_id.to_string(),
            })
            .await?;
        decode_history(customer_id, records)
    }

    #[tracing::instrument(skip_all, err, fields(customer_id = %wallet.customer_id))]
    async fn store(&self, wallet: &mut Wallet) -> Result<(), WalletStoreError> {
        if wallet.pending_events().is_empty() {
            return Ok(());
        }

        let mut tx = self.db.begin().await?;
        let stored_max = WalletEventRecord::max_version(&mut tx, &wallet.customer_id).await?;
        check_expected_version(stored_max, wallet)?;

        let expected = wallet.base_version();
        for (record, projection) in encode_pending(wallet, stored_max)? {
            record
                .insert(&mut tx)
                .await
                .map_err(|e| conflict_on_duplicate(e, expected, record.version))?;
            if let Some(projection) = projection {
                projection.insert(&mut tx).await?;
            }
        }
        tx.commit().await?;

        tracing::debug!(
            customer_id = %wallet.customer_id,
            appended = wallet.pending_events().len(),
            version = wallet.version(),
            "Wallet events stored"
        );
        wallet.clear_pending();
        Ok(())
    }

    async fn exists(&self, customer_id: &str) -> Result<bool, WalletStoreError> {
        let count = self
            .db
            .process(CountWalletEvents {
                aggregate_id: customer_id.to_string(),
            })
            .await?;
        Ok(count > 0)
    }

    async fn withdrawals(
        &self,
        customer_id: &str,
    ) -> Result<Vec<WithdrawalProjection>, WalletStoreError> {
        Ok(self
            .db
            .process(GetWithdrawals {
                customer_id: customer_id.to_string(),
            })
            .await?)
    }
}
