mod payments;
mod server;
mod settings;

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::payments::store::PaymentStore;
use crate::payments::Payments;
use crate::server::ApiState;

#[tokio::main]
async fn main() -> Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    // Load configuration from environment
    let cfg = settings::Config::from_env();

    // A live deployment needs at least one gateway credential; demo mode
    // runs on the simulator instead.
    if !cfg.simulation.enabled
        && cfg.daraja.consumer_key.is_empty()
        && cfg.airtel.client_id.is_empty()
    {
        tracing::error!("No gateway credentials configured and simulation disabled; exiting");
        return Ok(());
    }
    if cfg.simulation.enabled {
        tracing::warn!("Gateway simulation enabled - provider outcomes are synthetic");
    }
    tracing::info!("Starting mobile-money payment service");

    let store = Arc::new(PaymentStore::open(&cfg.database_path)?);
    let payments = Payments::new(&cfg, store)?;

    let state = ApiState {
        initiator: Arc::new(payments.initiator),
        callbacks: payments.callbacks,
        store: payments.store,
    };

    server::run_server(cfg.server_port, state).await
}
