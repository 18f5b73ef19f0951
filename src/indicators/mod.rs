// =============================================================================
// Incremental indicator engine
// =============================================================================
//
// Calculators are incremental and warm-startable: each one can rebuild its
// internal state from the latest snapshot persisted in the `indicators`
// database, then continue from the next closed candle as if the process had
// never restarted.
//
// Threading: updates for one `(symbol, interval)` pair are serialized through
// that pair's async mutex. The boot-time history sync and the post-reconnect
// gap-fill share the same entry point as the dispatcher; the per-calculator
// monotonic-start guard additionally rejects any duplicate delivery that
// slips through.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::market_data::{Candle, CandleKey};
use crate::store::{self, MongoStore, DB_INDICATORS, DB_MARKET_INFO};

pub mod rsi;

pub use rsi::Rsi;

/// Number of persisted candles replayed into a cold-started calculator.
pub const DEFAULT_HISTORY_WINDOW: i64 = 20;

/// RSI period used when instantiating the default calculator list.
const DEFAULT_RSI_PERIOD: u32 = 14;

// ---------------------------------------------------------------------------
// State snapshot
// ---------------------------------------------------------------------------

/// Durable snapshot of one calculator at one candle boundary.
///
/// The fixed fields identify the calculator and the candle it last consumed;
/// everything calculator-specific lives in the sparse `values` map (for RSI:
/// `prev_close`, `seeded`, `warmup_count`, `sum_gain`, `sum_loss`, `avg_gain`,
/// `avg_loss` and, once seeded, `rsi`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorState {
    pub name: String,
    pub symbol: String,
    pub interval: String,
    pub start_time: i64,
    pub end_time: i64,
    pub period: u32,
    pub values: HashMap<String, f64>,
}

// ---------------------------------------------------------------------------
// Calculator capability set
// ---------------------------------------------------------------------------

/// An incremental indicator calculator.
///
/// Implementations are not thread-safe on their own; the engine serializes
/// access per pair.
pub trait IndicatorCalculator: Send {
    fn name(&self) -> &'static str;

    fn period(&self) -> u32;

    /// Rebuild internal state from a persisted snapshot.
    ///
    /// Returns `SyncError::State` when the snapshot does not belong to this
    /// calculator (wrong name/period) or is missing required values; the
    /// caller falls back to a cold start.
    fn load_state(&mut self, state: &IndicatorState) -> Result<(), SyncError>;

    /// Consume one candle. Returns `true` when internal state changed (the
    /// caller then persists [`IndicatorCalculator::snapshot`]); `false` for
    /// non-final candles, duplicates, and the initial seed observation.
    fn update(&mut self, candle: &Candle) -> bool;

    /// Latest durable snapshot, if the calculator has consumed anything.
    fn snapshot(&self) -> Option<IndicatorState>;
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Owns the per-pair calculator lists and drives persistence.
pub struct IndicatorEngine {
    store: MongoStore,
    calculators: HashMap<CandleKey, Mutex<Vec<Box<dyn IndicatorCalculator>>>>,
}

impl IndicatorEngine {
    pub fn new(store: MongoStore) -> Self {
        Self {
            store,
            calculators: HashMap::new(),
        }
    }

    /// Instantiate the configured calculator list for every
    /// `(symbol, interval)` cross product. Currently the list is `RSI(14)`;
    /// additional calculators slot in here.
    pub fn load_calculators(&mut self, symbols: &[String], intervals: &[String]) {
        for symbol in symbols {
            for interval in intervals {
                let key = CandleKey {
                    symbol: symbol.to_uppercase(),
                    interval: interval.clone(),
                };
                if self.calculators.contains_key(&key) {
                    continue;
                }
                debug!(key = %key, "calculator set created");
                let list: Vec<Box<dyn IndicatorCalculator>> =
                    vec![Box::new(Rsi::new(DEFAULT_RSI_PERIOD))];
                self.calculators.insert(key, Mutex::new(list));
            }
        }
        info!(pairs = self.calculators.len(), "indicator calculators loaded");
    }

    /// Warm-start every calculator from its latest persisted snapshot.
    ///
    /// Absence of a snapshot is not an error: the newest `history_window`
    /// persisted candles are replayed instead so the calculator can seed
    /// before live data arrives. A snapshot that fails validation is logged
    /// and cold-starts through the same replay path.
    pub async fn load_states(&self, history_window: i64) {
        for (key, entry) in &self.calculators {
            let mut calcs = entry.lock().await;
            for calc in calcs.iter_mut() {
                let collection = store::indicator_collection(
                    calc.name(),
                    calc.period(),
                    &key.symbol,
                    &key.interval,
                );

                let snapshot = match self
                    .store
                    .read_indicator_latest(DB_INDICATORS, &collection)
                    .await
                {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!(key = %key, error = %e, "indicator state read failed");
                        None
                    }
                };

                if !restore_snapshot(key, calc.as_mut(), snapshot.as_ref()) {
                    self.replay_history(key, calc.as_mut(), history_window).await;
                }
            }
        }
    }

    /// Cold-start fallback: replay the newest persisted candles through the
    /// calculator without persisting intermediate snapshots.
    async fn replay_history(
        &self,
        key: &CandleKey,
        calc: &mut dyn IndicatorCalculator,
        history_window: i64,
    ) {
        let collection = store::market_collection(&key.symbol, &key.interval);
        match self
            .store
            .latest_n_descending(DB_MARKET_INFO, &collection, None, history_window)
            .await
        {
            Ok(window) if !window.is_empty() => {
                for candle in &window {
                    calc.update(candle);
                }
                debug!(
                    key = %key,
                    indicator = calc.name(),
                    candles = window.len(),
                    "calculator warmed from candle history"
                );
            }
            Ok(_) => {
                debug!(key = %key, indicator = calc.name(), "no history yet, cold start");
            }
            Err(e) => {
                warn!(key = %key, error = %e, "history replay failed, cold start");
            }
        }
    }

    /// Feed one closed candle to every calculator registered for its pair;
    /// persist each calculator's snapshot when it reports an update.
    pub async fn process_new_candle(&self, candle: &Candle) -> Result<(), SyncError> {
        let key = candle.key();
        let Some(entry) = self.calculators.get(&key) else {
            // Not a configured pair; nothing to do.
            return Ok(());
        };

        let mut calcs = entry.lock().await;
        for calc in calcs.iter_mut() {
            if !calc.update(candle) {
                continue;
            }
            if let Some(snapshot) = calc.snapshot() {
                let collection = store::indicator_collection(
                    calc.name(),
                    calc.period(),
                    &key.symbol,
                    &key.interval,
                );
                self.store
                    .write_indicator_state(DB_INDICATORS, &collection, &snapshot)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Try to warm a calculator from a stored snapshot.
///
/// Returns `false` when the calculator still needs the candle-history
/// replay: either no snapshot exists, or the snapshot was rejected by
/// `load_state` (wrong calculator, wrong period, missing values).
fn restore_snapshot(
    key: &CandleKey,
    calc: &mut dyn IndicatorCalculator,
    snapshot: Option<&IndicatorState>,
) -> bool {
    match snapshot {
        Some(state) => match calc.load_state(state) {
            Ok(()) => {
                info!(
                    key = %key,
                    indicator = calc.name(),
                    starttime = state.start_time,
                    "indicator state restored"
                );
                true
            }
            Err(e) => {
                warn!(
                    key = %key,
                    indicator = calc.name(),
                    error = %e,
                    "stored state rejected, falling back to history replay"
                );
                false
            }
        },
        None => false,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn pair_key() -> CandleKey {
        CandleKey {
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
        }
    }

    fn candle_at(index: i64, close: f64) -> Candle {
        let start = index * 60_000;
        Candle {
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            start_time: start,
            end_time: start + 59_999,
            event_time: start + 59_999,
            first_trade_id: 0,
            last_trade_id: 0,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            quote_volume: close,
            trade_count: 1,
            taker_buy_volume: 0.5,
            taker_buy_quote_volume: close / 2.0,
            is_final: true,
        }
    }

    fn seeded_snapshot(period: u32) -> IndicatorState {
        IndicatorState {
            name: "rsi".into(),
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            start_time: 840_000,
            end_time: 899_999,
            period,
            values: HashMap::from([
                ("prev_close".into(), 46.6875),
                ("seeded".into(), 1.0),
                ("avg_gain".into(), 0.5848),
                ("avg_loss".into(), 0.5446),
            ]),
        }
    }

    #[test]
    fn matching_snapshot_restores_without_replay() {
        let key = pair_key();
        let mut calc = Rsi::new(14);
        let snapshot = seeded_snapshot(14);
        assert!(restore_snapshot(&key, &mut calc, Some(&snapshot)));
    }

    #[test]
    fn missing_snapshot_requires_replay() {
        let key = pair_key();
        let mut calc = Rsi::new(14);
        assert!(!restore_snapshot(&key, &mut calc, None));
    }

    #[test]
    fn rejected_snapshot_falls_back_to_replay() {
        let key = pair_key();
        let mut calc = Rsi::new(14);

        // Period mismatch: load_state errors, so the caller must replay.
        let stale = seeded_snapshot(7);
        assert!(!restore_snapshot(&key, &mut calc, Some(&stale)));

        // The replay path warms the rejected calculator from candle history
        // exactly as a cold start would.
        for i in 0..16 {
            calc.update(&candle_at(i, 100.0 + i as f64));
        }
        let snap = calc.snapshot().expect("replayed calculator has a snapshot");
        assert_eq!(snap.values["seeded"], 1.0);
    }
}
