use crate::entities::{
    AccrualRepository, Order, OrderError, OrderNumber, OrderRepository, OrderState,
};
use loyalty_sdk::objects::OrderResponse;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Order lifecycle on top of the order and accrual repositories.
#[derive(Clone)]
pub struct OrderService {
    orders: Arc<dyn OrderRepository>,
    accruals: Arc<dyn AccrualRepository>,
}

impl OrderService {
    pub fn new(orders: Arc<dyn OrderRepository>, accruals: Arc<dyn AccrualRepository>) -> Self {
        Self { orders, accruals }
    }

    fn duplicate(existing: &Order, customer_id: &str) -> OrderError {
        if existing.customer_id == customer_id {
            OrderError::AlreadySubmitted(existing.number.clone())
        } else {
            OrderError::OwnedByAnotherCustomer(existing.number.clone())
        }
    }

    /// Register a new order for `customer_id`.
    pub async fn submit(&self, customer_id: &str, number: &str) -> Result<Order, OrderError> {
        let number = OrderNumber::parse(number)?;
        if let Some(existing) = self.orders.find_by_number(number.as_str()).await? {
            return Err(Self::duplicate(&existing, customer_id));
        }

        let order = Order::new(number, customer_id);
        if !self.orders.insert(&order).await? {
            // lost a race against a concurrent submission of the same number
            return match self.orders.find_by_number(&order.number).await? {
                Some(existing) => Err(Self::duplicate(&existing, customer_id)),
                None => Err(OrderError::AlreadySubmitted(order.number)),
            };
        }

        info!(order_number = %order.number, customer_id, "Order submitted");
        Ok(order)
    }

    /// A customer's orders, newest first, with the latest known accrual.
    pub async fn customer_orders(
        &self,
        customer_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<OrderResponse>, OrderError> {
        let orders = self.orders.for_customer(customer_id, limit, offset).await?;
        let numbers: Vec<String> = orders.iter().map(|o| o.number.clone()).collect();
        let accruals = self.accruals.latest_for(&numbers).await?;

        Ok(orders
            .into_iter()
            .map(|order| OrderResponse {
                accrual: accruals.get(&order.number).map(|a| a.amount),
                number: order.number,
                status: order.state.into(),
                uploaded_at: order.created_at,
            })
            .collect())
    }

    pub async fn unprocessed(&self, limit: i64) -> Result<Vec<Order>, OrderError> {
        Ok(self.orders.unprocessed(limit).await?)
    }

    /// Move an order to the state reported by the accrual calculator.
    ///
    /// Returns `false` when nothing changed: the order is already there, or the
    /// verdict is older than what is stored.
    pub async fn apply_accrual(&self, number: &str, next: OrderState) -> Result<bool, OrderError> {
        loop {
            let Some(mut order) = self.orders.find_by_number(number).await? else {
                return Err(OrderError::NotFound(number.to_string()));
            };
            let from = order.state;
            match order.advance(next) {
                Ok(false) => return Ok(false),
                Ok(true) => {}
                Err(OrderError::IllegalTransition { from, to, .. }) => {
                    warn!(order_number = number, %from, %to, "Ignoring stale accrual verdict");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }

            if self.orders.advance_state(number, from, next).await? {
                debug!(order_number = number, %from, to = %next, "Order state advanced");
                return Ok(true);
            }
            // state moved underneath us, re-read and decide again
        }
    }
}
