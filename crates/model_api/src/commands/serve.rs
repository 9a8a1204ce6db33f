//! Serve commands - run one of the HTTP services.

use anyhow::{Context, Result};
use axum::Router;
use config::Config;
use model_api::{AppState, Settings, SingleState, persistent, single};
use tokio::net::TcpListener;
use tracing::info;

use super::open_stores;

/// Runs the persistent multi-model service.
///
/// Settles interrupted writes before accepting requests.
///
/// # Errors
///
/// Returns an error if the stores cannot be opened or the server fails.
pub async fn run_persistent(config: &Config, bind: Option<String>) -> Result<()> {
    let (records, artifacts) = open_stores(config).await?;

    let report = database::reconcile(&records, &artifacts)
        .await
        .context("Startup reconciliation failed")?;
    if !report.is_clean() {
        info!(?report, "Repaired unsettled models");
    }

    let state = AppState::new(records, artifacts, Settings::from_config(config));
    listen(persistent::router(state), bind.as_deref().unwrap_or(&config.bind_addr)).await
}

/// Runs the single-model service.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn run_single(config: &Config, bind: Option<String>) -> Result<()> {
    let state = SingleState::new(Settings::from_config(config));
    listen(single::router(state), bind.as_deref().unwrap_or(&config.bind_addr)).await
}

async fn listen(app: Router, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutting down");
    }
}
