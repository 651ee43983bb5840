//! In-memory doubles for the repository and upstream seams.

use crate::entities::wallet_events::{WalletEventRecord, WithdrawalProjection};
use crate::entities::{AccrualRecord, AccrualRepository, Order, OrderRepository, OrderState};
use crate::events::{DomainEvent, EventHandler, HandlerError};
use crate::processors::accrual_source::{AccrualPoll, AccrualSource, SourceError};
use crate::wallet::store::{decode_history, encode_pending};
use crate::wallet::{Wallet, WalletEventStore, WalletStoreError, check_expected_version};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryOrders {
    orders: Mutex<Vec<Order>>,
}

impl MemoryOrders {
    /// Insert without validating the number.
    pub fn seed(&self, number: &str, customer_id: &str, state: OrderState) {
        self.orders.lock().unwrap().push(Order {
            id: Uuid::now_v7(),
            number: number.to_string(),
            customer_id: customer_id.to_string(),
            created_at: OffsetDateTime::now_utc(),
            state,
        });
    }

    pub fn state_of(&self, number: &str) -> Option<OrderState> {
        self.orders
            .lock()
            .unwrap()
            .iter()
            .find(|o| o.number == number)
            .map(|o| o.state)
    }
}

#[async_trait]
impl OrderRepository for MemoryOrders {
    async fn find_by_number(&self, number: &str) -> Result<Option<Order>, sqlx::Error> {
        Ok(self
            .orders
            .lock()
            .unwrap()
            .iter()
            .find(|o| o.number == number)
            .cloned())
    }

    async fn insert(&self, order: &Order) -> Result<bool, sqlx::Error> {
        let mut orders = self.orders.lock().unwrap();
        if orders.iter().any(|o| o.number == order.number) {
            return Ok(false);
        }
        orders.push(order.clone());
        Ok(true)
    }

    async fn unprocessed(&self, limit: i64) -> Result<Vec<Order>, sqlx::Error> {
        let mut pending: Vec<Order> = self
            .orders
            .lock()
            .unwrap()
            .iter()
            .filter(|o| OrderState::UNRESOLVED.contains(&o.state))
            .cloned()
            .collect();
        pending.sort_by_key(|o| o.created_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn for_customer(
        &self,
        customer_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Order>, sqlx::Error> {
        let mut owned: Vec<Order> = self
            .orders
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.customer_id == customer_id)
            .cloned()
            .collect();
        owned.sort_by_key(|o| std::cmp::Reverse(o.created_at));
        Ok(owned
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn advance_state(
        &self,
        number: &str,
        from: OrderState,
        to: OrderState,
    ) -> Result<bool, sqlx::Error> {
        let mut orders = self.orders.lock().unwrap();
        match orders
            .iter_mut()
            .find(|o| o.number == number && o.state == from)
        {
            Some(order) => {
                order.state = to;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct MemoryAccruals {
    records: Mutex<Vec<AccrualRecord>>,
}

impl MemoryAccruals {
    /// Stored records of one order, oldest first.
    pub fn records_for(&self, order_number: &str) -> Vec<AccrualRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.order_number == order_number)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AccrualRepository for MemoryAccruals {
    async fn save(&self, record: &AccrualRecord) -> Result<bool, sqlx::Error> {
        let mut records = self.records.lock().unwrap();
        let latest = records
            .iter()
            .rev()
            .find(|r| r.order_number == record.order_number);
        if latest.is_some_and(|r| r.state == record.state) {
            return Ok(false);
        }
        records.push(record.clone());
        Ok(true)
    }

    async fn latest(&self, order_number: &str) -> Result<Option<AccrualRecord>, sqlx::Error> {
        Ok(self.records_for(order_number).pop())
    }

    async fn latest_for(
        &self,
        order_numbers: &[String],
    ) -> Result<HashMap<String, AccrualRecord>, sqlx::Error> {
        Ok(order_numbers
            .iter()
            .filter_map(|n| self.records_for(n).pop().map(|r| (n.clone(), r)))
            .collect())
    }
}

#[derive(Default)]
struct Streams {
    events: HashMap<String, Vec<WalletEventRecord>>,
    withdrawals: Vec<WithdrawalProjection>,
}

/// Holds its lock across check and append, like the database transaction.
#[derive(Default)]
pub struct MemoryWalletStore {
    streams: tokio::sync::Mutex<Streams>,
}

#[async_trait]
impl WalletEventStore for MemoryWalletStore {
    async fn load(&self, customer_id: &str) -> Result<Wallet, WalletStoreError> {
        let records = self
            .streams
            .lock()
            .await
            .events
            .get(customer_id)
            .cloned()
            .unwrap_or_default();
        decode_history(customer_id, records)
    }

    async fn store(&self, wallet: &mut Wallet) -> Result<(), WalletStoreError> {
        if wallet.pending_events().is_empty() {
            return Ok(());
        }
        let mut streams = self.streams.lock().await;
        let stored_max = streams
            .events
            .get(&wallet.customer_id)
            .and_then(|s| s.last())
            .map_or(0, |r| r.version);
        check_expected_version(stored_max, wallet)?;

        for (record, projection) in encode_pending(wallet, stored_max)? {
            streams
                .events
                .entry(wallet.customer_id.clone())
                .or_default()
                .push(record);
            if let Some(projection) = projection {
                streams.withdrawals.push(projection);
            }
        }
        wallet.clear_pending();
        Ok(())
    }

    async fn exists(&self, customer_id: &str) -> Result<bool, WalletStoreError> {
        Ok(self
            .streams
            .lock()
            .await
            .events
            .get(customer_id)
            .is_some_and(|s| !s.is_empty()))
    }

    async fn withdrawals(
        &self,
        customer_id: &str,
    ) -> Result<Vec<WithdrawalProjection>, WalletStoreError> {
        Ok(self
            .streams
            .lock()
            .await
            .withdrawals
            .iter()
            .rev()
            .filter(|w| w.customer_id == customer_id)
            .cloned()
            .collect())
    }
}

/// One scripted upstream answer.
#[derive(Debug, Clone)]
pub enum Step {
    Poll(AccrualPoll),
    TimedOut,
    Malformed,
}

/// Replays scripted answers per order number. The last step repeats.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedSource {
    pub fn script(&self, order_number: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(order_number.to_string(), steps.into());
    }

    pub fn calls(&self, order_number: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(order_number)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl AccrualSource for ScriptedSource {
    async fn poll(&self, order_number: &str) -> Result<AccrualPoll, SourceError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(order_number.to_string())
            .or_default() += 1;

        let step = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(order_number) {
                Some(steps) if steps.len() > 1 => steps.pop_front(),
                Some(steps) => steps.front().cloned(),
                None => None,
            }
        };

        match step {
            Some(Step::Poll(poll)) => Ok(poll),
            Some(Step::TimedOut) => Err(SourceError::Timeout(Duration::from_secs(10))),
            Some(Step::Malformed) => Err(SourceError::Malformed("unexpected body".to_string())),
            None => Ok(AccrualPoll::Rejected { status: 404 }),
        }
    }
}

/// Records every event it receives.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<DomainEvent>>,
    notify: Notify,
}

impl RecordingHandler {
    pub fn received(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Wait until at least `count` events arrived.
    pub async fn wait_for(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.notify.notified();
                if self.events.lock().unwrap().len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .unwrap();
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    fn name(&self) -> &'static str {
        "recorder"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        self.events.lock().unwrap().push(event.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}
