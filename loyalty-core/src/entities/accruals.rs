//! Accrual verdicts fetched from the external calculator.
//!
//! Records are append-only; the newest one per order is authoritative.
//!
//! ```text
//! accruals(id BIGSERIAL PK, order_number TEXT, state order_state,
//!          amount NUMERIC, created_at TIMESTAMPTZ)
//! ```

use super::orders::OrderState;
use crate::framework::DatabaseProcessor;
use async_trait::async_trait;
use kanau::processor::Processor;
use rust_decimal::Decimal;
use std::collections::HashMap;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct AccrualRecord {
    pub order_number: String,
    pub state: OrderState,
    pub amount: Decimal,
    pub created_at: OffsetDateTime,
}

impl AccrualRecord {
    pub fn new(order_number: impl Into<String>, state: OrderState, amount: Decimal) -> Self {
        Self {
            order_number: order_number.into(),
            state,
            amount,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

#[async_trait]
pub trait AccrualRepository: Send + Sync {
    /// Append `record` unless the latest stored verdict for the order already
    /// carries the same state. Returns whether a row was appended.
    async fn save(&self, record: &AccrualRecord) -> Result<bool, sqlx::Error>;

    async fn latest(&self, order_number: &str) -> Result<Option<AccrualRecord>, sqlx::Error>;

    /// Latest record for each of `order_numbers` that has one.
    async fn latest_for(
        &self,
        order_numbers: &[String],
    ) -> Result<HashMap<String, AccrualRecord>, sqlx::Error>;
}

#[derive(Debug, Clone)]
pub struct AppendAccrualRecord {
    pub record: AccrualRecord,
}

impl Processor<AppendAccrualRecord> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:AppendAccrualRecord")]
    async fn process(&self, cmd: AppendAccrualRecord) -> Result<bool, sqlx::Error> {
        let AppendAccrualRecord { record } = cmd;
        let result = sqlx::query(
            r#"
            INSERT INTO accruals (order_number, state, amount, created_at)
            SELECT $1, $2, $3, $4
            WHERE NOT EXISTS (
                SELECT 1 FROM (
                    SELECT state FROM accruals
                    WHERE order_number = $1
                    ORDER BY created_at DESC, id DESC
                    LIMIT 1
                ) latest
                WHERE latest.state = $2
            )
            "#,
        )
        .bind(record.order_number)
        .bind(record.state)
        .bind(record.amount)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, Clone)]
pub struct GetLatestAccrual {
    pub order_number: String,
}

impl Processor<GetLatestAccrual> for DatabaseProcessor {
    type Output = Option<AccrualRecord>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetLatestAccrual")]
    async fn process(&self, query: GetLatestAccrual) -> Result<Option<AccrualRecord>, sqlx::Error> {
        sqlx::query_as::<_, AccrualRecord>(
            r#"
            SELECT order_number, state, amount, created_at
            FROM accruals
            WHERE order_number = $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(query.order_number)
        .fetch_optional(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct GetLatestAccruals {
    pub order_numbers: Vec<String>,
}

impl Processor<GetLatestAccruals> for DatabaseProcessor {
    type Output = Vec<AccrualRecord>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetLatestAccruals")]
    async fn process(&self, query: GetLatestAccruals) -> Result<Vec<AccrualRecord>, sqlx::Error> {
        sqlx::query_as::<_, AccrualRecord>(
            r#"
            SELECT DISTINCT ON (order_number) order_number, state, amount, created_at
            FROM accruals
            WHERE order_number = ANY($1)
            ORDER BY order_number, created_at DESC, id DESC
            "#,
        )
        .bind(query.order_numbers)
        .fetch_all(&self.pool)
        .await
    }
}

#[async_trait]
impl AccrualRepository for DatabaseProcessor {
    async fn save(&self, record: &AccrualRecord) -> Result<bool, sqlx::Error> {
        self.process(AppendAccrualRecord {
            record: record.clone(),
        })
        .await
    }

    async fn latest(&self, order_number: &str) -> Result<Option<AccrualRecord>, sqlx::Error> {
        self.process(GetLatestAccrual {
            order_number: order_number.to_string(),
        })
        .await
    }

    async fn latest_for(
        &self,
        order_numbers: &[String],
    ) -> Result<HashMap<String, AccrualRecord>, sqlx::Error> {
        if order_numbers.is_empty() {
            return Ok(HashMap::new());
        }
        let records = self
            .process(GetLatestAccruals {
                order_numbers: order_numbers.to_vec(),
            })
            .await?;
        Ok(records
            .into_iter()
            .map(|r| (r.order_number.clone(), r))
            .collect())
    }
}
