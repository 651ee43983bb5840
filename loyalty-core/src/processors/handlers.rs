//! Subscribers reacting to domain events.

use crate::entities::OrderState;
use crate::events::{
    ACCRUAL_CREATED, DomainEvent, EventBus, EventHandler, HandlerError, USER_REGISTERED,
};
use crate::services::{OrderService, WalletService};
use async_trait::async_trait;
use loyalty_sdk::objects::AccrualStatus;
use std::sync::Arc;
use tracing::info;

/// Moves the order to the state of a freshly stored verdict.
pub struct OrderStateUpdater {
    orders: OrderService,
}

impl OrderStateUpdater {
    pub fn new(orders: OrderService) -> Self {
        Self { orders }
    }
}

#[async_trait]
impl EventHandler for OrderStateUpdater {
    fn name(&self) -> &'static str {
        "order_state_updater"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let DomainEvent::AccrualCreated(event) = event else {
            return Err(HandlerError::UnexpectedEvent(event.name()));
        };
        self.orders
            .apply_accrual(&event.order_number, OrderState::from(event.status))
            .await?;
        Ok(())
    }
}

/// Credits the customer's wallet with a `PROCESSED` award.
pub struct WalletCreditor {
    wallets: WalletService,
}

impl WalletCreditor {
    pub fn new(wallets: WalletService) -> Self {
        Self { wallets }
    }
}

#[async_trait]
impl EventHandler for WalletCreditor {
    fn name(&self) -> &'static str {
        "wallet_creditor"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let DomainEvent::AccrualCreated(event) = event else {
            return Err(HandlerError::UnexpectedEvent(event.name()));
        };
        if event.status != AccrualStatus::Processed {
            return Ok(());
        }
        let balance = self
            .wallets
            .deposit(&event.customer_id, event.amount)
            .await?;
        info!(
            customer_id = %event.customer_id,
            order_number = %event.order_number,
            %balance,
            "Accrual credited"
        );
        Ok(())
    }
}

/// Opens a wallet for every newly registered customer.
pub struct WalletOpener {
    wallets: WalletService,
}

impl WalletOpener {
    pub fn new(wallets: WalletService) -> Self {
        Self { wallets }
    }
}

#[async_trait]
impl EventHandler for WalletOpener {
    fn name(&self) -> &'static str {
        "wallet_opener"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let DomainEvent::UserRegistered(event) = event else {
            return Err(HandlerError::UnexpectedEvent(event.name()));
        };
        self.wallets.open(&event.user_id).await?;
        Ok(())
    }
}

/// Subscribe the order and wallet reactions to their events.
pub fn register_event_handlers(bus: &EventBus, orders: OrderService, wallets: WalletService) {
    bus.subscribe(ACCRUAL_CREATED, Arc::new(OrderStateUpdater::new(orders)));
    bus.subscribe(ACCRUAL_CREATED, Arc::new(WalletCreditor::new(wallets.clone())));
    bus.subscribe(USER_REGISTERED, Arc::new(WalletOpener::new(wallets)));
}
