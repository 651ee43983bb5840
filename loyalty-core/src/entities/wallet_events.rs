//! Persisted wallet event stream and the withdrawal projection.
//!
//! ```text
//! wallet_events(event_id UUID PK, aggregate_id TEXT, event_type TEXT,
//!               event_data JSONB, version BIGINT, timestamp TIMESTAMPTZ,
//!               UNIQUE (aggregate_id, version))
//! wallet_withdrawals(id UUID PK, event_id UUID, customer_id TEXT,
//!                    amount NUMERIC, order_number TEXT, timestamp TIMESTAMPTZ)
//! ```
//!
//! The aggregate id of a wallet is its customer id.

use crate::framework::{DatabaseAccessor, DatabaseProcessor};
use kanau::processor::Processor;
use rust_decimal::Decimal;
use sqlx::types::Json;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct WalletEventRecord {
    pub event_id: Uuid,
    pub aggregate_id: String,
    pub event_type: String,
    pub event_data: Json<serde_json::Value>,
    pub version: i64,
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct WithdrawalProjection {
    pub id: Uuid,
    pub event_id: Uuid,
    pub customer_id: String,
    pub amount: Decimal,
    pub order_number: String,
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct GetWalletEvents {
    pub aggregate_id: String,
}

impl Processor<GetWalletEvents> for DatabaseProcessor {
    type Output = Vec<WalletEventRecord>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetWalletEvents")]
    async fn process(&self, query: GetWalletEvents) -> Result<Vec<WalletEventRecord>, sqlx::Error> {
        sqlx::query_as::<_, WalletEventRecord>(
            r#"
            SELECT event_id, aggregate_id, event_type, event_data, version, timestamp
            FROM wallet_events
            WHERE aggregate_id = $1
            ORDER BY version ASC
            "#,
        )
        .bind(query.aggregate_id)
        .fetch_all(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct CountWalletEvents {
    pub aggregate_id: String,
}

impl Processor<CountWalletEvents> for DatabaseProcessor {
    type Output = i64;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:CountWalletEvents")]
    async fn process(&self, query: CountWalletEvents) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM wallet_events WHERE aggregate_id = $1
            "#,
        )
        .bind(query.aggregate_id)
        .fetch_one(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct GetWithdrawals {
    pub customer_id: String,
}

impl Processor<GetWithdrawals> for DatabaseProcessor {
    type Output = Vec<WithdrawalProjection>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetWithdrawals")]
    async fn process(&self, query: GetWithdrawals) -> Result<Vec<WithdrawalProjection>, sqlx::Error> {
        sqlx::query_as::<_, WithdrawalProjection>(
            r#"
            SELECT id, event_id, customer_id, amount, order_number, timestamp
            FROM wallet_withdrawals
            WHERE customer_id = $1
            ORDER BY timestamp DESC
            "#,
        )
        .bind(query.customer_id)
        .fetch_all(&self.pool)
        .await
    }
}

impl WalletEventRecord {
    /// Highest stored version of an aggregate, 0 if it has no events.
    pub async fn max_version(
        db: &mut impl DatabaseAccessor,
        aggregate_id: &str,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(MAX(version), 0)::BIGINT
            FROM wallet_events
            WHERE aggregate_id = $1
            "#,
        )
        .bind(aggregate_id)
        .fetch_one(db.acquire())
        .await
    }

    pub async fn insert(&self, db: &mut impl DatabaseAccessor) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO wallet_events
                (event_id, aggregate_id, event_type, event_data, version, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(self.event_id)
        .bind(&self.aggregate_id)
        .bind(&self.event_type)
        .bind(&self.event_data)
        .bind(self.version)
        .bind(self.timestamp)
        .execute(db.acquire())
        .await?;
        Ok(())
    }
}

impl WithdrawalProjection {
    pub async fn insert(&self, db: &mut impl DatabaseAccessor) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO wallet_withdrawals
                (id, event_id, customer_id, amount, order_number, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(self.id)
        .bind(self.event_id)
        .bind(&self.customer_id)
        .bind(self.amount)
        .bind(&self.order_number)
        .bind(self.timestamp)
        .execute(db.acquire())
        .await?;
        Ok(())
    }
}
