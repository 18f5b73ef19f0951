// =============================================================================
// History sync — REST back-fill to the live boundary
// =============================================================================
//
// One worker per `(symbol, interval)` pair. Each iteration asks the store for
// its high-water mark, pages the REST klines endpoint from there, drops the
// not-yet-closed tail, feeds indicators, and upserts the remainder. A short
// page means the pair has converged with the live stream.
//
// The same sweep doubles as the post-reconnect gap filler; an atomic
// once-flag coalesces overlapping requests so at most one sweep runs at a
// time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::SyncError;
use crate::indicators::IndicatorEngine;
use crate::market_data::{self, Candle};
use crate::store::{self, MongoStore, DB_MARKET_INFO};

/// Maximum klines per REST page; a shorter page signals convergence.
const PAGE_LIMIT: usize = 1000;
/// Pause before retrying an iteration that failed.
const RETRY_DELAY: Duration = Duration::from_secs(1);
/// Per-request timeout for the klines endpoint.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const REST_BASE_URL: &str = "https://api.binance.com";

#[derive(Clone)]
pub struct HistorySync {
    store: MongoStore,
    engine: Arc<IndicatorEngine>,
    clock: Arc<dyn Clock>,
    symbols: Vec<String>,
    intervals: Vec<String>,
    backfill_start_ms: i64,
    danger_accept_invalid_certs: bool,
    base_url: String,
}

enum SyncStep {
    /// More pages remain; keep looping.
    Continue,
    /// The pair has converged with the live stream.
    CaughtUp,
}

impl HistorySync {
    pub fn new(
        store: MongoStore,
        engine: Arc<IndicatorEngine>,
        clock: Arc<dyn Clock>,
        symbols: Vec<String>,
        intervals: Vec<String>,
        backfill_start_ms: i64,
        danger_accept_invalid_certs: bool,
    ) -> Self {
        Self {
            store,
            engine,
            clock,
            symbols,
            intervals,
            backfill_start_ms,
            danger_accept_invalid_certs,
            base_url: REST_BASE_URL.to_string(),
        }
    }

    /// Back-fill every configured pair to convergence. Blocks until all
    /// workers finish; called before the live client starts.
    pub async fn run_initial_sync(&self) {
        info!(
            symbols = ?self.symbols,
            intervals = ?self.intervals,
            "history sync starting"
        );
        self.run_all_pairs().await;
        info!("history sync complete");
    }

    /// Launch one detached gap-fill sweep over every configured pair.
    ///
    /// Requests coalesce through `in_flight`: while a sweep is running,
    /// further calls return immediately. The flag clears when the sweep
    /// finishes, so the next reconnect can fill again.
    pub fn spawn_gap_fill(&self, in_flight: &Arc<AtomicBool>) {
        if in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("gap-fill already in flight, request coalesced");
            return;
        }

        let this = self.clone();
        let flag = in_flight.clone();
        tokio::spawn(async move {
            info!("post-reconnect gap-fill starting");
            this.run_all_pairs().await;
            flag.store(false, Ordering::SeqCst);
            info!("post-reconnect gap-fill complete");
        });
    }

    /// One worker task per pair; a panicking or failing worker never takes
    /// the others down.
    async fn run_all_pairs(&self) {
        let mut workers = JoinSet::new();
        for symbol in &self.symbols {
            for interval in &self.intervals {
                let this = self.clone();
                let symbol = symbol.to_uppercase();
                let interval = interval.clone();
                workers.spawn(async move { this.sync_pair(symbol, interval).await });
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "history worker aborted");
            }
        }
    }

    /// Drive one pair until it is caught up. Failed iterations retry from
    /// the store's current high-water mark after a short pause.
    async fn sync_pair(&self, symbol: String, interval: String) {
        let collection = store::market_collection(&symbol, &interval);
        let mut total = 0usize;

        loop {
            match self.sync_iteration(&symbol, &interval, &collection).await {
                Ok((SyncStep::CaughtUp, written)) => {
                    total += written;
                    info!(
                        symbol = %symbol,
                        interval = %interval,
                        candles = total,
                        "pair caught up"
                    );
                    return;
                }
                Ok((SyncStep::Continue, written)) => {
                    total += written;
                }
                Err(e) => {
                    warn!(
                        symbol = %symbol,
                        interval = %interval,
                        error = %e,
                        "history iteration failed, retrying"
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    async fn sync_iteration(
        &self,
        symbol: &str,
        interval: &str,
        collection: &str,
    ) -> Result<(SyncStep, usize)> {
        let (latest_start, latest_end) = self
            .store
            .latest_synced_range(DB_MARKET_INFO, collection)
            .await
            .context("failed to query latest synced range")?;

        let next_start = if latest_start == 0 {
            self.backfill_start_ms
        } else {
            latest_end + 1
        };
        debug!(symbol, interval, next_start, "requesting kline page");

        let fetched = fetch_klines(
            &self.base_url,
            self.danger_accept_invalid_certs,
            symbol,
            interval,
            next_start,
            PAGE_LIMIT,
        )
        .await?;

        let fetched_len = fetched.len();
        let closed = filter_closed(fetched, self.clock.now_ms());
        if closed.is_empty() {
            return Ok((SyncStep::CaughtUp, 0));
        }

        for candle in &closed {
            // An indicator persistence failure must not hold back the candle
            // batch; the snapshot upsert catches up on the next update.
            if let Err(e) = self.engine.process_new_candle(candle).await {
                warn!(
                    symbol,
                    interval,
                    starttime = candle.start_time,
                    error = %e,
                    "indicator update failed during back-fill"
                );
            }
        }

        self.store
            .bulk_upsert_closed(DB_MARKET_INFO, &closed)
            .await
            .context("failed to upsert candle batch")?;

        // Convergence is judged on the raw page size: a full page whose tail
        // was dropped by the grace filter still means the exchange has more.
        let step = if page_exhausted(fetched_len) {
            SyncStep::CaughtUp
        } else {
            SyncStep::Continue
        };
        Ok((step, closed.len()))
    }
}

/// A shorter-than-limit page means the exchange has nothing newer.
fn page_exhausted(fetched_len: usize) -> bool {
    fetched_len < PAGE_LIMIT
}

/// Drop candles whose interval has not fully elapsed (plus grace) yet.
/// REST marks every row closed, so the wall clock is the only tail filter.
fn filter_closed(candles: Vec<Candle>, now_ms: i64) -> Vec<Candle> {
    candles
        .into_iter()
        .filter(|c| {
            let closed = c.is_closed_by(now_ms);
            if !closed {
                debug!(
                    symbol = %c.symbol,
                    interval = %c.interval,
                    starttime = c.start_time,
                    "dropping not-yet-closed candle"
                );
            }
            closed
        })
        .collect()
}

/// GET `/api/v3/klines` and parse the response.
///
/// Builds a fresh client per call so each request runs on its own TLS
/// session.
async fn fetch_klines(
    base_url: &str,
    accept_invalid_certs: bool,
    symbol: &str,
    interval: &str,
    start_ms: i64,
    limit: usize,
) -> Result<Vec<Candle>, SyncError> {
    let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
    if accept_invalid_certs {
        builder = builder.danger_accept_invalid_certs(true);
    }
    let client = builder
        .build()
        .map_err(|e| SyncError::Transport(format!("failed to build REST client: {e}")))?;

    let url = format!(
        "{base_url}/api/v3/klines?symbol={symbol}&interval={interval}&startTime={start_ms}&limit={limit}"
    );
    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| SyncError::Transport(format!("GET /api/v3/klines failed: {e}")))?;

    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| SyncError::Transport(format!("failed to read klines body: {e}")))?;
    if !status.is_success() {
        return Err(SyncError::Protocol(format!(
            "GET /api/v3/klines returned {status}: {body}"
        )));
    }

    let candles = market_data::parse_rest_array(&body, symbol, interval)?;
    debug!(symbol, interval, count = candles.len(), "klines fetched");
    Ok(candles)
}
