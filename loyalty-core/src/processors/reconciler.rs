//! AccrualReconciler processor.
//!
//! The AccrualReconciler is responsible for:
//! - Fetching a page of orders still in `NEW` or `PROCESSING` on every tick
//! - Polling the accrual calculator once per order, concurrently, behind a
//!   rate limiter shared by the whole cycle
//! - Storing each verdict and publishing `accrual.created` when it is new
//! - Advancing an order left behind a verdict it already received, for when
//!   the state update published earlier was lost
//!
//! Orders that could not be resolved keep their state and come back on the
//! next cycle.

use super::accrual_source::{AccrualPoll, AccrualSource};
use crate::config::ReconcilerConfig;
use crate::entities::{AccrualRecord, AccrualRepository, Order, OrderError, OrderState};
use crate::events::{AccrualCreated, EventBus};
use crate::services::OrderService;
use crate::utils::rate_limiter::RateLimiter;
use loyalty_sdk::objects::AccrualResponse;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Counts of one reconciliation cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub polled: usize,
    pub resolved: usize,
    pub abandoned: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A verdict was stored. `appended` is false when it repeated the latest one.
    Resolved { appended: bool },
    /// Retry budget exhausted; the order is left for the next cycle.
    Abandoned,
    Cancelled,
}

pub struct AccrualReconciler {
    orders: OrderService,
    accruals: Arc<dyn AccrualRepository>,
    source: Arc<dyn AccrualSource>,
    bus: EventBus,
    config: ReconcilerConfig,
}

impl AccrualReconciler {
    pub fn new(
        orders: OrderService,
        accruals: Arc<dyn AccrualRepository>,
        source: Arc<dyn AccrualSource>,
        bus: EventBus,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            orders,
            accruals,
            source,
            bus,
            config,
        }
    }

    /// Run cycles every `poll_interval` until shutdown is signalled.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            base_url = %self.config.accrual_base_url,
            interval_secs = self.config.poll_interval.as_secs(),
            "AccrualReconciler started"
        );

        while !*shutdown_rx.borrow() {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("AccrualReconciler received shutdown signal");
                        break;
                    }
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.run_cycle(&shutdown_rx).await {
                        Ok(report) if report.polled == 0 => {
                            debug!("No unprocessed orders");
                        }
                        Ok(report) => {
                            info!(
                                polled = report.polled,
                                resolved = report.resolved,
                                abandoned = report.abandoned,
                                cancelled = report.cancelled,
                                "Reconciliation cycle complete"
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to fetch unprocessed orders");
                        }
                    }
                }
            }
        }

        info!("AccrualReconciler shutdown complete");
    }

    /// One pass over the current page of unprocessed orders.
    ///
    /// Returns once every worker has finished.
    pub async fn run_cycle(
        &self,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> Result<CycleReport, OrderError> {
        let orders = self.orders.unprocessed(self.config.page_size).await?;
        if orders.is_empty() {
            return Ok(CycleReport::default());
        }

        let limiter = Arc::new(RateLimiter::new());
        let mut report = CycleReport {
            polled: orders.len(),
            ..CycleReport::default()
        };

        let mut workers = JoinSet::new();
        for order in orders {
            let poller = OrderPoller {
                order,
                orders: self.orders.clone(),
                accruals: self.accruals.clone(),
                source: self.source.clone(),
                bus: self.bus.clone(),
                limiter: limiter.clone(),
                retry_budget: self.config.retry_budget,
                retry_delay: self.config.retry_delay,
                shutdown_rx: shutdown_rx.clone(),
            };
            workers.spawn(poller.run());
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(PollOutcome::Resolved { .. }) => report.resolved += 1,
                Ok(PollOutcome::Abandoned) => report.abandoned += 1,
                Ok(PollOutcome::Cancelled) => report.cancelled += 1,
                Err(e) => {
                    error!(error = %e, "Order poller task failed");
                    report.abandoned += 1;
                }
            }
        }

        Ok(report)
    }
}

/// Resolves when shutdown is requested. Never resolves if the sender is gone.
async fn cancelled(shutdown_rx: &mut watch::Receiver<bool>) {
    if shutdown_rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Worker polling the accrual of a single order.
struct OrderPoller {
    order: Order,
    orders: OrderService,
    accruals: Arc<dyn AccrualRepository>,
    source: Arc<dyn AccrualSource>,
    bus: EventBus,
    limiter: Arc<RateLimiter>,
    retry_budget: u32,
    retry_delay: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl OrderPoller {
    async fn run(mut self) -> PollOutcome {
        let mut budget = self.retry_budget;

        loop {
            if *self.shutdown_rx.borrow() {
                return PollOutcome::Cancelled;
            }

            if self.limiter.is_limiting() {
                tokio::select! {
                    biased;
                    _ = cancelled(&mut self.shutdown_rx) => return PollOutcome::Cancelled,
                    _ = self.limiter.await_clear() => {}
                }
                continue;
            }

            let poll = tokio::select! {
                biased;
                _ = cancelled(&mut self.shutdown_rx) => return PollOutcome::Cancelled,
                poll = self.source.poll(&self.order.number) => poll,
            };

            let failure = match poll {
                Ok(AccrualPoll::Ready(response)) => match self.record(response).await {
                    Ok(appended) => return PollOutcome::Resolved { appended },
                    Err(e) => format!("failed to store accrual: {e}"),
                },
                Ok(AccrualPoll::Throttled(signal)) => {
                    self.limiter.observe(&signal);
                    // an echo of a window that has already cleared
                    if !self.limiter.is_limiting() && !self.pause().await {
                        return PollOutcome::Cancelled;
                    }
                    continue;
                }
                Err(e) if e.is_transient() => {
                    debug!(order_number = %self.order.number, error = %e, "Transient poll failure");
                    if !self.pause().await {
                        return PollOutcome::Cancelled;
                    }
                    continue;
                }
                Ok(AccrualPoll::Rejected { status }) => format!("unexpected status {status}"),
                Err(e) => e.to_string(),
            };

            budget = budget.saturating_sub(1);
            if budget == 0 {
                warn!(
                    order_number = %self.order.number,
                    error = %failure,
                    "Retry budget exhausted, leaving order for the next cycle"
                );
                return PollOutcome::Abandoned;
            }
            debug!(
                order_number = %self.order.number,
                error = %failure,
                remaining = budget,
                "Accrual poll failed"
            );
            if !self.pause().await {
                return PollOutcome::Cancelled;
            }
        }
    }

    /// Sleep `retry_delay`. Returns false if shutdown came first.
    async fn pause(&mut self) -> bool {
        tokio::select! {
            biased;
            _ = cancelled(&mut self.shutdown_rx) => false,
            _ = tokio::time::sleep(self.retry_delay) => true,
        }
    }

    /// Store the verdict and announce it if it is new.
    ///
    /// A repeated verdict is not announced again, since that would credit
    /// the wallet twice; the order is advanced here instead if it lags.
    async fn record(&self, response: AccrualResponse) -> Result<bool, sqlx::Error> {
        if response.order != self.order.number {
            warn!(
                order_number = %self.order.number,
                reported = %response.order,
                "Accrual response names another order"
            );
        }

        let state = OrderState::from(response.status);
        let record = AccrualRecord::new(self.order.number.clone(), state, response.accrual);
        let appended = self.accruals.save(&record).await?;

        if appended {
            info!(
                order_number = %self.order.number,
                status = %response.status,
                amount = %response.accrual,
                "Accrual recorded"
            );
            let _ = self.bus.publish(AccrualCreated {
                order_number: self.order.number.clone(),
                amount: response.accrual,
                status: response.status,
                customer_id: self.order.customer_id.clone(),
            });
        } else {
            debug!(order_number = %self.order.number, %state, "Accrual verdict unchanged");
            if self.order.state != state {
                self.repair_state(state).await;
            }
        }
        Ok(appended)
    }

    async fn repair_state(&self, state: OrderState) {
        match self.orders.apply_accrual(&self.order.number, state).await {
            Ok(true) => info!(
                order_number = %self.order.number,
                from = %self.order.state,
                to = %state,
                "Order state caught up with stored accrual"
            ),
            Ok(false) => {}
            Err(e) => warn!(
                order_number = %self.order.number,
                error = %e,
                "Failed to catch order state up with stored accrual"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ACCRUAL_CREATED, DomainEvent, EventHandler, HandlerError};
    use crate::processors::handlers::OrderStateUpdater;
    use crate::testing::{MemoryAccruals, MemoryOrders, RecordingHandler, ScriptedSource, Step};
    use crate::utils::rate_limiter::ThrottleSignal;
    use loyalty_sdk::objects::AccrualStatus;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::Instant;
    use url::Url;

    struct Fixture {
        reconciler: AccrualReconciler,
        orders: Arc<MemoryOrders>,
        accruals: Arc<MemoryAccruals>,
        source: Arc<ScriptedSource>,
        events: Arc<RecordingHandler>,
        shutdown_tx: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
    }

    fn fixture() -> Fixture {
        let orders = Arc::new(MemoryOrders::default());
        let accruals = Arc::new(MemoryAccruals::default());
        let source = Arc::new(ScriptedSource::default());
        let events = Arc::new(RecordingHandler::default());
        let bus = EventBus::new();
        bus.subscribe(ACCRUAL_CREATED, events.clone());
        let config = ReconcilerConfig::new(Url::parse("http://accrual.test").unwrap());
        let reconciler = AccrualReconciler::new(
            OrderService::new(orders.clone(), accruals.clone()),
            accruals.clone(),
            source.clone(),
            bus,
            config,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Fixture {
            reconciler,
            orders,
            accruals,
            source,
            events,
            shutdown_tx,
            shutdown_rx,
        }
    }

    fn ready(order: &str, status: AccrualStatus, accrual: i64) -> Step {
        Step::Poll(AccrualPoll::Ready(AccrualResponse {
            order: order.to_string(),
            status,
            accrual: Decimal::from(accrual),
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_processed_verdict_is_saved_and_published_once() {
        let f = fixture();
        // reconciliation treats numbers as opaque, even ones failing the checksum
        f.orders.seed("111", "customer-1", OrderState::New);
        f.source
            .script("111", vec![ready("111", AccrualStatus::Processed, 50)]);

        let report = f.reconciler.run_cycle(&f.shutdown_rx).await.unwrap();
        assert_eq!(
            report,
            CycleReport {
                polled: 1,
                resolved: 1,
                abandoned: 0,
                cancelled: 0
            }
        );
        f.events.wait_for(1).await;

        // nothing advances the order here, so the next cycle polls it again
        let report = f.reconciler.run_cycle(&f.shutdown_rx).await.unwrap();
        assert_eq!(report.resolved, 1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(f.accruals.records_for("111").len(), 1);
        assert_eq!(f.source.calls("111"), 2);
        // the repeated verdict caught the order up without a second event
        assert_eq!(f.orders.state_of("111"), Some(OrderState::Processed));
        assert_eq!(
            f.events.received(),
            vec![DomainEvent::AccrualCreated(AccrualCreated {
                order_number: "111".to_string(),
                amount: Decimal::from(50),
                status: AccrualStatus::Processed,
                customer_id: "customer-1".to_string(),
            })]
        );
    }

    /// Updates order state, except on its first delivery.
    struct DropsFirstDelivery {
        inner: OrderStateUpdater,
        dropped: AtomicBool,
    }

    #[async_trait]
    impl EventHandler for DropsFirstDelivery {
        fn name(&self) -> &'static str {
            "drops_first_delivery"
        }

        async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
            if !self.dropped.swap(true, Ordering::SeqCst) {
                return Err(HandlerError::UnexpectedEvent(event.name()));
            }
            self.inner.handle(event).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_state_update_is_repaired_by_next_cycle() {
        let orders = Arc::new(MemoryOrders::default());
        let accruals = Arc::new(MemoryAccruals::default());
        let source = Arc::new(ScriptedSource::default());
        let events = Arc::new(RecordingHandler::default());
        let service = OrderService::new(orders.clone(), accruals.clone());
        let bus = EventBus::new();
        bus.subscribe(
            ACCRUAL_CREATED,
            Arc::new(DropsFirstDelivery {
                inner: OrderStateUpdater::new(service.clone()),
                dropped: AtomicBool::new(false),
            }),
        );
        bus.subscribe(ACCRUAL_CREATED, events.clone());
        let reconciler = AccrualReconciler::new(
            service,
            accruals.clone(),
            source.clone(),
            bus,
            ReconcilerConfig::new(Url::parse("http://accrual.test").unwrap()),
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        orders.seed("79927398713", "c", OrderState::New);
        source.script(
            "79927398713",
            vec![ready("79927398713", AccrualStatus::Processed, 30)],
        );

        reconciler.run_cycle(&shutdown_rx).await.unwrap();
        events.wait_for(1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(orders.state_of("79927398713"), Some(OrderState::New));

        let report = reconciler.run_cycle(&shutdown_rx).await.unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(
            orders.state_of("79927398713"),
            Some(OrderState::Processed)
        );

        let report = reconciler.run_cycle(&shutdown_rx).await.unwrap();
        assert_eq!(report.polled, 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls("79927398713"), 2);
        assert_eq!(events.received().len(), 1);
        assert_eq!(accruals.records_for("79927398713").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progressing_verdict_is_appended() {
        let f = fixture();
        f.orders.seed("79927398713", "c", OrderState::New);
        f.source.script(
            "79927398713",
            vec![
                ready("79927398713", AccrualStatus::Processing, 0),
                ready("79927398713", AccrualStatus::Processed, 120),
            ],
        );

        f.reconciler.run_cycle(&f.shutdown_rx).await.unwrap();
        f.reconciler.run_cycle(&f.shutdown_rx).await.unwrap();
        f.events.wait_for(2).await;

        let records = f.accruals.records_for("79927398713");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].state, OrderState::Processed);
        assert_eq!(records[1].amount, Decimal::from(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_pauses_without_consuming_budget() {
        let f = fixture();
        f.orders.seed("12345678903", "c", OrderState::Processing);
        f.source.script(
            "12345678903",
            vec![
                Step::Poll(AccrualPoll::Throttled(ThrottleSignal::too_many_requests(
                    Some("3".to_string()),
                ))),
                ready("12345678903", AccrualStatus::Invalid, 0),
            ],
        );

        let start = Instant::now();
        let report = f.reconciler.run_cycle(&f.shutdown_rx).await.unwrap();
        assert_eq!(report.resolved, 1);
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(f.source.calls("12345678903"), 2);
        assert_eq!(
            f.accruals.records_for("12345678903")[0].state,
            OrderState::Invalid
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_exhaust_budget() {
        let f = fixture();
        f.orders.seed("4561261212345467", "c", OrderState::New);
        f.source.script(
            "4561261212345467",
            vec![Step::Poll(AccrualPoll::Rejected { status: 500 })],
        );

        let report = f.reconciler.run_cycle(&f.shutdown_rx).await.unwrap();
        assert_eq!(report.abandoned, 1);
        assert_eq!(f.source.calls("4561261212345467"), 5);
        assert!(f.accruals.records_for("4561261212345467").is_empty());
        assert_eq!(
            f.orders.state_of("4561261212345467"),
            Some(OrderState::New)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_body_consumes_budget_but_timeouts_do_not() {
        let f = fixture();
        f.orders.seed("18", "c", OrderState::New);
        f.source.script(
            "18",
            vec![
                Step::TimedOut,
                Step::TimedOut,
                Step::TimedOut,
                Step::TimedOut,
                Step::TimedOut,
                Step::TimedOut,
                Step::Malformed,
                Step::Malformed,
                Step::Malformed,
                Step::Malformed,
                ready("18", AccrualStatus::Processed, 7),
            ],
        );

        let report = f.reconciler.run_cycle(&f.shutdown_rx).await.unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(f.source.calls("18"), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_workers() {
        let f = fixture();
        f.orders.seed("111", "c", OrderState::New);
        f.orders.seed("18", "c", OrderState::New);
        f.source
            .script("111", vec![Step::Poll(AccrualPoll::Rejected { status: 503 })]);
        f.shutdown_tx.send(true).unwrap();

        let report = f.reconciler.run_cycle(&f.shutdown_rx).await.unwrap();
        assert_eq!(report.cancelled, 2);
        assert_eq!(f.source.calls("111"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_page_skips_cycle() {
        let f = fixture();
        f.orders.seed("111", "c", OrderState::Processed);
        let report = f.reconciler.run_cycle(&f.shutdown_rx).await.unwrap();
        assert_eq!(report, CycleReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exits_on_shutdown() {
        let f = fixture();
        let handle = tokio::spawn(f.reconciler.run(f.shutdown_rx.clone()));
        tokio::time::sleep(Duration::from_secs(25)).await;
        f.shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
