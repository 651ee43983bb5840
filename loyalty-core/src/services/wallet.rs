use crate::wallet::{Wallet, WalletCommand, WalletError, WalletEventStore, WalletStoreError};
use loyalty_sdk::objects::{BalanceResponse, WithdrawalResponse};
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum WalletServiceError {
    #[error(transparent)]
    Domain(#[from] WalletError),

    #[error(transparent)]
    Store(#[from] WalletStoreError),
}

impl WalletServiceError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(
            self,
            WalletServiceError::Store(WalletStoreError::VersionConflict { .. })
        )
    }
}

/// Load, command, store. Conflicts are returned to the caller, not retried.
#[derive(Clone)]
pub struct WalletService {
    store: Arc<dyn WalletEventStore>,
}

impl WalletService {
    pub fn new(store: Arc<dyn WalletEventStore>) -> Self {
        Self { store }
    }

    async fn execute(
        &self,
        customer_id: &str,
        command: WalletCommand,
    ) -> Result<Wallet, WalletServiceError> {
        let mut wallet = self.store.load(customer_id).await?;
        wallet.handle(command)?;
        self.store.store(&mut wallet).await?;
        Ok(wallet)
    }

    pub async fn open(&self, customer_id: &str) -> Result<(), WalletServiceError> {
        if self.store.exists(customer_id).await? {
            return Err(WalletError::AlreadyExists.into());
        }
        self.execute(customer_id, WalletCommand::Create).await?;
        info!(customer_id, "Wallet opened");
        Ok(())
    }

    pub async fn deposit(
        &self,
        customer_id: &str,
        amount: Decimal,
    ) -> Result<Decimal, WalletServiceError> {
        let wallet = self
            .execute(customer_id, WalletCommand::Deposit { amount })
            .await?;
        info!(customer_id, %amount, balance = %wallet.balance(), "Wallet credited");
        Ok(wallet.balance())
    }

    pub async fn withdraw(
        &self,
        customer_id: &str,
        order_number: &str,
        amount: Decimal,
    ) -> Result<Decimal, WalletServiceError> {
        let wallet = self
            .execute(
                customer_id,
                WalletCommand::Withdraw {
                    order_number: order_number.to_string(),
                    amount,
                },
            )
            .await?;
        info!(customer_id, order_number, %amount, "Withdrawal recorded");
        Ok(wallet.balance())
    }

    pub async fn balance(&self, customer_id: &str) -> Result<BalanceResponse, WalletServiceError> {
        let wallet = self.store.load(customer_id).await?;
        if !wallet.is_opened() {
            return Err(WalletError::NotOpened.into());
        }
        Ok(BalanceResponse {
            current: wallet.balance(),
            withdrawn: wallet.withdrawn(),
        })
    }

    /// Most recent first.
    pub async fn withdrawals(
        &self,
        customer_id: &str,
    ) -> Result<Vec<WithdrawalResponse>, WalletServiceError> {
        Ok(self
            .store
            .withdrawals(customer_id)
            .await?
            .into_iter()
            .map(|w| WithdrawalResponse {
                order: w.order_number,
                sum: w.amount,
                processed_at: w.timestamp,
            })
            .collect())
    }
}
