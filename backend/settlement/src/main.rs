//! Batch settlement engine — entry point.
//!
//! Sells fractional units of production batches (egg layers, broilers),
//! keeps investor wallets on an append-only ledger and settles per-cycle
//! payouts. A background task periodically reconciles the ledger invariants
//! while an Axum REST API serves investors and operators.

mod allocator;
mod api;
mod audit;
mod auth;
mod capacity;
mod config;
mod db;
mod errors;
mod exit;
mod ledger;
mod payout;
mod types;

#[cfg(test)]
mod test_support;
#[cfg(test)]
mod test_api;
#[cfg(test)]
mod test_ledger;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use audit::AuditState;
use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(
        &config.database_url,
        config.db_max_connections,
        Duration::from_millis(config.db_busy_timeout_ms),
    )
    .await?;

    let shutdown = CancellationToken::new();

    // ─── Background audit ─────────────────────────────────
    let audit_state = Arc::new(AuditState {
        pool: pool.clone(),
        interval_secs: config.audit_interval_secs,
    });
    let audit_task = tokio::spawn(audit::run(audit_state, shutdown.clone()));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState {
        pool: pool.clone(),
        gateway_token: config.gateway_token.clone(),
    });
    let app = api::router(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {e}");
        }
        info!("Shutdown requested");
        signal.cancel();
    });

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    shutdown.cancel();
    if let Err(e) = audit_task.await {
        warn!("Audit task ended abnormally: {e}");
    }
    pool.close().await;
    info!("Settlement engine stopped");

    Ok(())
}
