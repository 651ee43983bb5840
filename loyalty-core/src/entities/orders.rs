//! Orders submitted by customers and the Luhn check guarding their numbers.
//!
//! Storage layout:
//!
//! ```text
//! orders(id UUID PK, number TEXT UNIQUE, customer_id TEXT,
//!        created_at TIMESTAMPTZ, state order_state)
//! ```

use crate::framework::DatabaseProcessor;
use async_trait::async_trait;
use kanau::processor::Processor;
use loyalty_sdk::objects::AccrualStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Lifecycle state of an order.
///
/// This is the sqlx::Type version. For API/DTO use, see `loyalty_sdk::objects::AccrualStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE", type_name = "order_state")]
pub enum OrderState {
    New,
    Processing,
    Invalid,
    Processed,
}

impl OrderState {
    /// States the accrual calculator may still change.
    pub const UNRESOLVED: [OrderState; 2] = [OrderState::New, OrderState::Processing];

    fn rank(self) -> u8 {
        match self {
            OrderState::New => 0,
            OrderState::Processing => 1,
            OrderState::Invalid | OrderState::Processed => 2,
        }
    }

    pub fn is_final(self) -> bool {
        self.rank() == 2
    }

    /// Whether `next` lies strictly ahead of `self` in the lifecycle.
    pub fn can_advance_to(self, next: OrderState) -> bool {
        !self.is_final() && next.rank() > self.rank()
    }
}

impl From<OrderState> for AccrualStatus {
    fn from(value: OrderState) -> Self {
        match value {
            OrderState::New => AccrualStatus::New,
            OrderState::Processing => AccrualStatus::Processing,
            OrderState::Invalid => AccrualStatus::Invalid,
            OrderState::Processed => AccrualStatus::Processed,
        }
    }
}

impl From<AccrualStatus> for OrderState {
    fn from(value: AccrualStatus) -> Self {
        match value {
            AccrualStatus::New => OrderState::New,
            AccrualStatus::Processing => OrderState::Processing,
            AccrualStatus::Invalid => OrderState::Invalid,
            AccrualStatus::Processed => OrderState::Processed,
        }
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(AccrualStatus::from(*self).as_str())
    }
}

/// Luhn mod-10 check. Digits at positions sharing the parity of the string
/// length (counted from the left, zero-based) are doubled.
pub fn is_valid_order_number(number: &str) -> bool {
    if number.is_empty() {
        return false;
    }
    let parity = number.len() % 2;
    let mut sum = 0u32;
    for (i, c) in number.chars().enumerate() {
        let Some(mut digit) = c.to_digit(10) else {
            return false;
        };
        if i % 2 == parity {
            digit *= 2;
            if digit > 9 {
                digit -= 9;
            }
        }
        sum += digit;
    }
    sum % 10 == 0
}

/// An order number that passed [`is_valid_order_number`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderNumber(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("order number {0:?} fails the checksum")]
pub struct InvalidOrderNumber(pub String);

impl OrderNumber {
    pub fn parse(number: impl Into<String>) -> Result<Self, InvalidOrderNumber> {
        let number = number.into();
        if is_valid_order_number(&number) {
            Ok(Self(number))
        } else {
            Err(InvalidOrderNumber(number))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OrderNumber {
    type Error = InvalidOrderNumber;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<OrderNumber> for String {
    fn from(value: OrderNumber) -> Self {
        value.0
    }
}

impl std::fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error(transparent)]
    InvalidNumber(#[from] InvalidOrderNumber),

    #[error("order {0} was already submitted by this customer")]
    AlreadySubmitted(String),

    #[error("order {0} belongs to another customer")]
    OwnedByAnotherCustomer(String),

    #[error("order {0} not found")]
    NotFound(String),

    #[error("order {number} cannot move from {from} to {to}")]
    IllegalTransition {
        number: String,
        from: OrderState,
        to: OrderState,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A stored order. `number` is kept as stored: the reconciliation feed
/// treats it as opaque and only submission validates it.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Order {
    pub id: Uuid,
    pub number: String,
    pub customer_id: String,
    pub created_at: OffsetDateTime,
    pub state: OrderState,
}

impl Order {
    pub fn new(number: OrderNumber, customer_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            number: number.into(),
            customer_id: customer_id.into(),
            created_at: OffsetDateTime::now_utc(),
            state: OrderState::New,
        }
    }

    /// Move forward to `next`.
    ///
    /// Returns `Ok(false)` if the order is already in `next`.
    pub fn advance(&mut self, next: OrderState) -> Result<bool, OrderError> {
        if self.state == next {
            return Ok(false);
        }
        if !self.state.can_advance_to(next) {
            return Err(OrderError::IllegalTransition {
                number: self.number.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(true)
    }
}

/// Storage of orders.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn find_by_number(&self, number: &str) -> Result<Option<Order>, sqlx::Error>;

    /// Insert a new order. Returns `false` if the number is already taken.
    async fn insert(&self, order: &Order) -> Result<bool, sqlx::Error>;

    /// Oldest-first page of orders in `New` or `Processing`.
    async fn unprocessed(&self, limit: i64) -> Result<Vec<Order>, sqlx::Error>;

    /// Newest-first page of a customer's orders.
    async fn for_customer(
        &self,
        customer_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Order>, sqlx::Error>;

    /// Compare-and-set the state. Returns `false` if the stored state was not `from`.
    async fn advance_state(
        &self,
        number: &str,
        from: OrderState,
        to: OrderState,
    ) -> Result<bool, sqlx::Error>;
}

#[derive(Debug, Clone)]
pub struct GetOrderByNumber {
    pub number: String,
}

impl Processor<GetOrderByNumber> for DatabaseProcessor {
    type Output = Option<Order>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetOrderByNumber")]
    async fn process(&self, query: GetOrderByNumber) -> Result<Option<Order>, sqlx::Error> {
        sqlx::query_as::<_, Order>(
            r#"
            SELECT id, number, customer_id, created_at, state
            FROM orders
            WHERE number = $1
            "#,
        )
        .bind(query.number)
        .fetch_optional(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct InsertOrder {
    pub order: Order,
}

impl Processor<InsertOrder> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:InsertOrder")]
    async fn process(&self, insert: InsertOrder) -> Result<bool, sqlx::Error> {
        let InsertOrder { order } = insert;
        let result = sqlx::query(
            r#"
            INSERT INTO orders (id, number, customer_id, created_at, state)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (number) DO NOTHING
            "#,
        )
        .bind(order.id)
        .bind(order.number)
        .bind(order.customer_id)
        .bind(order.created_at)
        .bind(order.state)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, Clone)]
pub struct GetOrdersByStates {
    pub states: Vec<OrderState>,
    pub limit: i64,
}

impl Processor<GetOrdersByStates> for DatabaseProcessor {
    type Output = Vec<Order>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetOrdersByStates")]
    async fn process(&self, query: GetOrdersByStates) -> Result<Vec<Order>, sqlx::Error> {
        sqlx::query_as::<_, Order>(
            r#"
            SELECT id, number, customer_id, created_at, state
            FROM orders
            WHERE state = ANY($1)
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(query.states)
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct GetCustomerOrders {
    pub customer_id: String,
    pub limit: i64,
    pub offset: i64,
}

impl Processor<GetCustomerOrders> for DatabaseProcessor {
    type Output = Vec<Order>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetCustomerOrders")]
    async fn process(&self, query: GetCustomerOrders) -> Result<Vec<Order>, sqlx::Error> {
        sqlx::query_as::<_, Order>(
            r#"
            SELECT id, number, customer_id, created_at, state
            FROM orders
            WHERE customer_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(query.customer_id)
        .bind(query.limit)
        .bind(query.offset)
        .fetch_all(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct AdvanceOrderState {
    pub number: String,
    pub from: OrderState,
    pub to: OrderState,
}

impl Processor<AdvanceOrderState> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:AdvanceOrderState")]
    async fn process(&self, cmd: AdvanceOrderState) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET state = $3
            WHERE number = $1 AND state = $2
            "#,
        )
        .bind(cmd.number)
        .bind(cmd.from)
        .bind(cmd.to)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl OrderRepository for DatabaseProcessor {
    async fn find_by_number(&self, number: &str) -> Result<Option<Order>, sqlx::Error> {
        self.process(GetOrderByNumber {
            number: number.to_string(),
        })
        .await
    }

    async fn insert(&self, order: &Order) -> Result<bool, sqlx::Error> {
        self.process(InsertOrder {
            order: order.clone(),
        })
        .await
    }

    async fn unprocessed(&self, limit: i64) -> Result<Vec<Order>, sqlx::Error> {
        self.process(GetOrdersByStates {
            states: OrderState::UNRESOLVED.to_vec(),
            limit,
        })
        .await
    }

    async fn for_customer(
        &self,
        customer_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Order>, sqlx::Error> {
        self.process(GetCustomerOrders {
            customer_id: customer_id.to_string(),
            limit,
            offset,
        })
        .await
    }

    async fn advance_state(
        &self,
        number: &str,
        from: OrderState,
        to: OrderState,
    ) -> Result<bool, sqlx::Error> {
        self.process(AdvanceOrderState {
            number: number.to_string(),
            from,
            to,
        })
        .await
    }
}
