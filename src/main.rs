// =============================================================================
// Demo Desk: Main Entry Point
// =============================================================================
//
// One feed listener produces ticks, one session task consumes them together
// with trade/balance commands from the API. Nothing but the session task
// mutates candles, trades, balance or ledger.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod error;
mod market_data;
mod runtime_config;
mod session;
mod settlement;
mod types;

use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::runtime_config::RuntimeConfig;
use crate::session::Session;

const CONFIG_PATH: &str = "runtime_config.json";
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Demo Desk — starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env();
    config.validate().context("invalid runtime config")?;

    info!(
        symbol = %config.symbol,
        granularity_secs = config.granularity_secs,
        candle_capacity = config.candle_capacity,
        payout_ratio = config.payout_ratio,
        policy = %config.active_trade_policy,
        "Configuration ready"
    );

    // ── 2. Session (single consumer) ─────────────────────────────────────
    let (session, session_task) = Session::start(&config);

    // ── 3. Feed listener (single producer) ───────────────────────────────
    let feed_config = config.clone();
    let ticks = session.tick_sender();
    let feed_task = tokio::spawn(async move {
        let delay = Duration::from_secs(feed_config.reconnect_delay_secs.max(1));
        loop {
            if let Err(e) =
                market_data::tick_stream::run_tick_stream(&feed_config, &ticks).await
            {
                error!(symbol = %feed_config.symbol, error = %e, "Tick stream error — reconnecting");
            }
            if ticks.is_closed() {
                break;
            }
            tokio::time::sleep(delay).await;
        }
    });

    // ── 4. API server ────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening");

    let app = api::rest::router(session.clone());
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Shutdown ──────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping");

    // Stop producers first; the session drains what is queued and returns.
    feed_task.abort();
    server_task.abort();
    let _ = feed_task.await;
    let _ = server_task.await;
    drop(session);

    // Open client connections may still hold a handle; don't wait forever.
    match tokio::time::timeout(SESSION_DRAIN_TIMEOUT, session_task).await {
        Ok(Ok(stopped)) => info!(state = ?stopped, "Session stopped"),
        Ok(Err(e)) => error!(error = %e, "Session task failed"),
        Err(_) => warn!("Session still referenced after shutdown timeout"),
    }

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Demo Desk shut down complete.");
    Ok(())
}
