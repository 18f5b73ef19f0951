// =============================================================================
// marketsync — Binance kline sync engine, main entry point
// =============================================================================
//
// Startup order matters: indicators warm-start from their persisted state,
// history sync runs to convergence for every configured pair, and only then
// does the live WebSocket come up. The dispatcher drains the stream buffer
// concurrently with the live client; after a reconnect the live client
// triggers a history gap-fill to close whatever the outage missed.
// =============================================================================

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use marketsync::buffer::StreamBuffer;
use marketsync::clock;
use marketsync::config::SyncConfig;
use marketsync::dispatcher::Dispatcher;
use marketsync::history::HistorySync;
use marketsync::indicators::{IndicatorEngine, DEFAULT_HISTORY_WINDOW};
use marketsync::live::LiveClient;
use marketsync::store::MongoStore;

const CONFIG_PATH: &str = "config.ini";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Logging & configuration ───────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("marketsync starting up");

    let config = match SyncConfig::load(CONFIG_PATH) {
        Ok(c) => c,
        Err(e) => {
            error!(path = CONFIG_PATH, error = %e, "configuration load failed");
            std::process::exit(1);
        }
    };
    info!(
        symbols = ?config.symbols,
        intervals = ?config.intervals,
        backfill_start_ms = config.backfill_start_ms,
        "configuration loaded"
    );

    // ── 2. External services ─────────────────────────────────────────────
    let store = MongoStore::connect(&config.database_uri).await?;

    // Producer and consumer connections are kept separate so the
    // dispatcher's blocking group reads never stall live publishes.
    let producer = StreamBuffer::connect(
        &config.redis_host,
        config.redis_port,
        config.redis_password.as_deref(),
    )
    .await?;
    let consumer = StreamBuffer::connect(
        &config.redis_host,
        config.redis_port,
        config.redis_password.as_deref(),
    )
    .await?;

    // ── 3. Indicator engine (warm start) ─────────────────────────────────
    let mut engine = IndicatorEngine::new(store.clone());
    engine.load_calculators(&config.symbols, &config.intervals);
    let engine = Arc::new(engine);
    engine.load_states(DEFAULT_HISTORY_WINDOW).await;

    // ── 4. History sync to convergence ───────────────────────────────────
    let history = Arc::new(HistorySync::new(
        store.clone(),
        engine.clone(),
        clock::system_clock(),
        config.symbols.clone(),
        config.intervals.clone(),
        config.backfill_start_ms,
        config.danger_accept_invalid_certs,
    ));
    history.run_initial_sync().await;

    // ── 5. Dispatcher ────────────────────────────────────────────────────
    let dispatcher = Dispatcher::new(consumer, store.clone(), engine.clone());
    tokio::spawn(async move {
        dispatcher.run().await;
    });

    // ── 6. Live client ───────────────────────────────────────────────────
    let live = LiveClient::new(
        producer,
        history.clone(),
        config.symbols.clone(),
        config.intervals.clone(),
        config.danger_accept_invalid_certs,
    );
    tokio::spawn(async move {
        live.run().await;
    });

    info!("all subsystems running; Ctrl+C to stop");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping");
    Ok(())
}
