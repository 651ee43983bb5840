//! Loyalty Ledger Server
//!
//! Reconciles order accruals with the external calculator and credits the
//! resulting points to customer wallets.

mod config;
mod shutdown;

use clap::Parser;
use config::{ConfigLoader, Overrides};
use loyalty_core::entities::{AccrualRepository, OrderRepository};
use loyalty_core::events::{EventBus, HandlerFailure};
use loyalty_core::framework::DatabaseProcessor;
use loyalty_core::processors::{AccrualReconciler, HttpAccrualSource, register_event_handlers};
use loyalty_core::services::{OrderService, WalletService};
use loyalty_core::wallet::PgWalletEventStore;
use shutdown::shutdown_signal;
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Loyalty Ledger - accrual reconciliation and wallet ledger
#[derive(Parser, Debug)]
#[command(name = "loyalty-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./loyalty.toml")]
    config: PathBuf,

    /// Postgres connection string
    #[arg(short = 'd', long, env = "DATABASE_URI")]
    database_uri: Option<String>,

    /// Address of the accrual calculator
    #[arg(short = 'r', long, env = "ACCRUAL_SYSTEM_ADDRESS")]
    accrual_address: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_loader = ConfigLoader::new(
        &args.config,
        Overrides {
            database_uri: args.database_uri,
            accrual_address: args.accrual_address,
        },
    );
    let loaded_config = config_loader.load()?;

    init_tracing(loaded_config.log_json);
    tracing::info!("Starting loyalty-server v{}", env!("CARGO_PKG_VERSION"));

    tracing::info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(loaded_config.database.max_connections)
        .connect(&loaded_config.database.url)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to database");
            e
        })?;
    tracing::info!("Database connection established");

    let db = DatabaseProcessor {
        pool: db_pool.clone(),
    };
    let order_repository: Arc<dyn OrderRepository> = Arc::new(db.clone());
    let accruals: Arc<dyn AccrualRepository> = Arc::new(db.clone());
    let orders = OrderService::new(order_repository, accruals.clone());
    let wallets = WalletService::new(Arc::new(PgWalletEventStore::new(db)));

    let lost_events = Arc::new(AtomicU64::new(0));
    let bus = EventBus::with_failure_hook({
        let lost_events = lost_events.clone();
        Arc::new(move |failure: &HandlerFailure| {
            lost_events.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                event = failure.event,
                handler = failure.handler,
                "Event delivery lost, needs manual reconciliation"
            );
        })
    });
    register_event_handlers(&bus, orders.clone(), wallets);

    let reconciler_config = loaded_config.reconciler;
    let source = HttpAccrualSource::new(
        reconciler_config.accrual_base_url.clone(),
        reconciler_config.request_timeout,
    )?;
    let reconciler =
        AccrualReconciler::new(orders, accruals, Arc::new(source), bus, reconciler_config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler_handle = tokio::spawn(reconciler.run(shutdown_rx));

    shutdown_signal().await?;
    let _ = shutdown_tx.send(true);
    reconciler_handle.await?;

    tracing::info!("Closing database connections...");
    db_pool.close().await;
    tracing::info!(
        lost_events = lost_events.load(Ordering::Relaxed),
        "Server shutdown complete"
    );

    Ok(())
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
