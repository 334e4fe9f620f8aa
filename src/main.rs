// =============================================================================
// Meridian Intraday Engine — Main Entry Point
// =============================================================================
//
// Composition root: one store, one broker client, one ingester client, and
// four worker loops (strategy-run worker, execution orchestrator, task
// dispatcher, task watchdog) plus the JSON API façade. Workers poll the
// shared store and advance state exclusively through compare-and-set
// transitions, so running extra replicas of any loop is safe.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod broker;
mod calendar;
mod config;
mod error;
mod ingester;
mod miner;
mod pacing;
mod store;
mod types;
mod workers;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiState;
use crate::broker::BrokerClient;
use crate::config::Settings;
use crate::ingester::IngesterClient;
use crate::pacing::Pacer;
use crate::store::Store;
use crate::workers::{ExecutionOrchestrator, RunWorker, TaskDispatcher, TaskWatchdog};

/// Symbol syncs admitted per pacer window.
const SYNC_BURST: u32 = 5;
/// Pacer window length.
const SYNC_WINDOW: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env();
    info!(
        database_url = %settings.database_url,
        broker_url = %settings.broker.base_url,
        ingester_url = %settings.ingester.base_url,
        "Meridian engine starting"
    );
    if settings.broker.api_key.is_empty() {
        warn!("BROKER_API_KEY not set — real-mode order placement will fail");
    }

    // ── 2. Store ─────────────────────────────────────────────────────────
    let store = Store::connect(&settings.database_url).await?;

    // ── 3. External clients ──────────────────────────────────────────────
    let broker = Arc::new(BrokerClient::new(settings.broker.clone()));
    let ingester = Arc::new(IngesterClient::new(settings.ingester.clone()));
    let pacer = Arc::new(Pacer::new(SYNC_BURST, SYNC_WINDOW));

    // ── 4. API server ────────────────────────────────────────────────────
    let api_state = Arc::new(ApiState {
        store: store.clone(),
        ingester: ingester.clone(),
    });
    let bind_addr = settings.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    // ── 5. Worker loops ──────────────────────────────────────────────────
    let shutdown = CancellationToken::new();

    let run_worker = RunWorker::new(
        store.clone(),
        ingester.clone(),
        pacer.clone(),
        Duration::from_secs(settings.run_poll_interval),
    );
    let run_worker_handle = tokio::spawn(run_worker.run(shutdown.child_token()));

    let orchestrator = ExecutionOrchestrator::new(
        store.clone(),
        Duration::from_secs(settings.run_poll_interval),
    );
    let orchestrator_handle = tokio::spawn(orchestrator.run(shutdown.child_token()));

    let dispatcher = TaskDispatcher::new(
        store.clone(),
        broker.clone(),
        Duration::from_secs(settings.dispatch_poll_interval),
        settings.dispatch_buffer_secs,
    );
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown.child_token()));

    let watchdog = TaskWatchdog::new(
        store.clone(),
        Duration::from_secs(settings.watchdog_poll_interval),
        settings.watchdog_buffer_secs,
    );
    let watchdog_handle = tokio::spawn(watchdog.run(shutdown.child_token()));

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping worker loops");
    shutdown.cancel();

    // Loops finish their in-flight tick before exiting; anything left
    // mid-flight self-resolves through the watchdog on the next start.
    let _ = tokio::join!(
        run_worker_handle,
        orchestrator_handle,
        dispatcher_handle,
        watchdog_handle
    );

    info!("Meridian engine shut down complete");
    Ok(())
}
