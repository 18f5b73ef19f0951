// =============================================================================
// Relative Strength Index (RSI) — incremental Wilder smoothing
// =============================================================================
//
// Incremental form of the classic RSI:
//
// Warm-up — accumulate gains/losses from consecutive closes until `period`
//           deltas have been seen, then seed the averages with their SMA.
// Run     — Wilder's exponential smoothing:
//             avg_gain = (avg_gain * (period - 1) + gain) / period
//             avg_loss = (avg_loss * (period - 1) + loss) / period
//           RS  = avg_gain / avg_loss
//           RSI = 100 - 100 / (1 + RS)
//
// Every state transition is captured in the snapshot, so a restarted process
// resumes mid-warm-up or mid-run without reprocessing history.

use std::collections::HashMap;

use crate::error::SyncError;
use crate::indicators::{IndicatorCalculator, IndicatorState};
use crate::market_data::Candle;

pub struct Rsi {
    period: u32,
    /// Whether the first close has been observed (it only seeds `prev_close`).
    initialized: bool,
    /// Whether the Wilder averages are live (warm-up complete).
    seeded: bool,
    /// Deltas accumulated so far during warm-up.
    warmup_count: u32,
    prev_close: f64,
    sum_gain: f64,
    sum_loss: f64,
    avg_gain: f64,
    avg_loss: f64,
    /// Start time of the last accepted candle; updates at or before this
    /// boundary are duplicates and are rejected.
    last_start: i64,
    latest: Option<IndicatorState>,
}

impl Rsi {
    pub fn new(period: u32) -> Self {
        Self {
            period,
            initialized: false,
            seeded: false,
            warmup_count: 0,
            prev_close: 0.0,
            sum_gain: 0.0,
            sum_loss: 0.0,
            avg_gain: 0.0,
            avg_loss: 0.0,
            last_start: i64::MIN,
            latest: None,
        }
    }

    /// RSI from the current averages, clamped the Wilder way: all-gain
    /// markets read 100 rather than dividing by zero.
    fn rsi_value(&self) -> f64 {
        if self.avg_loss == 0.0 {
            100.0
        } else {
            100.0 - 100.0 / (1.0 + self.avg_gain / self.avg_loss)
        }
    }

    fn make_snapshot(&self, candle: &Candle) -> IndicatorState {
        let mut values = HashMap::new();
        values.insert("prev_close".to_string(), self.prev_close);
        values.insert("seeded".to_string(), if self.seeded { 1.0 } else { 0.0 });
        values.insert("warmup_count".to_string(), f64::from(self.warmup_count));
        values.insert("sum_gain".to_string(), self.sum_gain);
        values.insert("sum_loss".to_string(), self.sum_loss);
        values.insert("avg_gain".to_string(), self.avg_gain);
        values.insert("avg_loss".to_string(), self.avg_loss);
        if self.seeded {
            values.insert("rsi".to_string(), self.rsi_value());
        }

        IndicatorState {
            name: self.name().to_string(),
            symbol: candle.symbol.clone(),
            interval: candle.interval.clone(),
            start_time: candle.start_time,
            end_time: candle.end_time,
            period: self.period,
            values,
        }
    }
}

impl IndicatorCalculator for Rsi {
    fn name(&self) -> &'static str {
        "rsi"
    }

    fn period(&self) -> u32 {
        self.period
    }

    fn update(&mut self, candle: &Candle) -> bool {
        if !candle.is_final {
            return false;
        }
        // Monotonic-start guard: replayed or re-delivered candles are no-ops.
        if candle.start_time <= self.last_start {
            return false;
        }

        if !self.initialized {
            self.prev_close = candle.close;
            self.initialized = true;
            self.last_start = candle.start_time;
            return false;
        }

        let change = candle.close - self.prev_close;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);

        if !self.seeded {
            self.sum_gain += gain;
            self.sum_loss += loss;
            self.warmup_count += 1;
            if self.warmup_count >= self.period {
                let period = f64::from(self.period);
                self.avg_gain = self.sum_gain / period;
                self.avg_loss = self.sum_loss / period;
                self.seeded = true;
            }
        } else {
            let period = f64::from(self.period);
            self.avg_gain = (self.avg_gain * (period - 1.0) + gain) / period;
            self.avg_loss = (self.avg_loss * (period - 1.0) + loss) / period;
        }

        self.prev_close = candle.close;
        self.last_start = candle.start_time;
        self.latest = Some(self.make_snapshot(candle));
        true
    }

    fn load_state(&mut self, state: &IndicatorState) -> Result<(), SyncError> {
        if state.name != self.name() {
            return Err(SyncError::State(format!(
                "snapshot is for `{}`, not `rsi`",
                state.name
            )));
        }
        if state.period != self.period {
            return Err(SyncError::State(format!(
                "snapshot period {} does not match calculator period {}",
                state.period, self.period
            )));
        }

        let prev_close = state
            .values
            .get("prev_close")
            .copied()
            .ok_or_else(|| SyncError::State("snapshot missing prev_close".into()))?;

        let avg_gain = state.values.get("avg_gain").copied();
        let avg_loss = state.values.get("avg_loss").copied();

        // Older snapshots predate the `seeded` marker; a pair of Wilder
        // averages implies the warm-up had completed.
        let seeded = match state.values.get("seeded") {
            Some(v) => *v != 0.0,
            None => avg_gain.is_some() && avg_loss.is_some(),
        };

        if seeded {
            let (Some(avg_gain), Some(avg_loss)) = (avg_gain, avg_loss) else {
                return Err(SyncError::State(
                    "seeded snapshot missing avg_gain/avg_loss".into(),
                ));
            };
            self.avg_gain = avg_gain;
            self.avg_loss = avg_loss;
            self.sum_gain = state.values.get("sum_gain").copied().unwrap_or(0.0);
            self.sum_loss = state.values.get("sum_loss").copied().unwrap_or(0.0);
            self.warmup_count = state
                .values
                .get("warmup_count")
                .map(|v| *v as u32)
                .unwrap_or(self.period);
        } else {
            let sum_gain = state
                .values
                .get("sum_gain")
                .copied()
                .ok_or_else(|| SyncError::State("warm-up snapshot missing sum_gain".into()))?;
            let sum_loss = state
                .values
                .get("sum_loss")
                .copied()
                .ok_or_else(|| SyncError::State("warm-up snapshot missing sum_loss".into()))?;
            let warmup_count = state
                .values
                .get("warmup_count")
                .map(|v| *v as u32)
                .ok_or_else(|| SyncError::State("warm-up snapshot missing warmup_count".into()))?;
            if warmup_count >= self.period {
                return Err(SyncError::State(format!(
                    "warm-up count {} out of range for period {}",
                    warmup_count, self.period
                )));
            }
            self.sum_gain = sum_gain;
            self.sum_loss = sum_loss;
            self.warmup_count = warmup_count;
            self.avg_gain = 0.0;
            self.avg_loss = 0.0;
        }

        self.prev_close = prev_close;
        self.seeded = seeded;
        self.initialized = true;
        self.last_start = state.start_time;
        self.latest = None;
        Ok(())
    }

    fn snapshot(&self) -> Option<IndicatorState> {
        self.latest.clone()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// Wilder's original worked example: first RSI(14) value is ~51.78.
    const WILDER_CLOSES: [f64; 15] = [
        46.1250, 47.1250, 46.4375, 46.9375, 44.9375, 44.2500, 44.6250, 45.7500, 47.8125, 47.5625,
        47.0000, 44.5625, 46.3125, 47.6875, 46.6875,
    ];

    fn candle_at(index: i64, close: f64, is_final: bool) -> Candle {
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
            is_final,
        }
    }

    fn feed_series(rsi: &mut Rsi, closes: &[f64]) -> Vec<bool> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| rsi.update(&candle_at(i as i64, c, true)))
            .collect()
    }

    // ---- update ----------------------------------------------------------

    #[test]
    fn wilder_reference_series() {
        let mut rsi = Rsi::new(14);
        let updated = feed_series(&mut rsi, &WILDER_CLOSES);

        // First close only seeds prev_close; the remaining 14 all update.
        assert!(!updated[0]);
        assert!(updated[1..].iter().all(|&u| u));

        let snap = rsi.snapshot().expect("seeded calculator has a snapshot");
        assert_eq!(snap.values["seeded"], 1.0);
        assert!(snap.values["warmup_count"] >= 14.0);

        let value = snap.values["rsi"];
        assert!(
            (value - 51.78).abs() < 0.05,
            "expected RSI ~51.78, got {value}"
        );
    }

    #[test]
    fn warmup_produces_no_rsi_value() {
        let mut rsi = Rsi::new(14);
        // 14 closes = 13 deltas: still one short of the seed.
        feed_series(&mut rsi, &WILDER_CLOSES[..14]);

        let snap = rsi.snapshot().expect("warm-up snapshots are persisted");
        assert_eq!(snap.values["seeded"], 0.0);
        assert!(snap.values["warmup_count"] < 14.0);
        assert!(!snap.values.contains_key("rsi"));
    }

    #[test]
    fn rejects_non_final_candles() {
        let mut rsi = Rsi::new(14);
        assert!(!rsi.update(&candle_at(0, 100.0, false)));
        assert!(rsi.snapshot().is_none());
    }

    #[test]
    fn rejects_non_monotonic_start_times() {
        let mut rsi = Rsi::new(14);
        feed_series(&mut rsi, &WILDER_CLOSES);
        let before = rsi.snapshot();

        // Same start as the last accepted candle, and an older one.
        assert!(!rsi.update(&candle_at(14, 99.0, true)));
        assert!(!rsi.update(&candle_at(3, 99.0, true)));
        assert_eq!(rsi.snapshot(), before);
    }

    #[test]
    fn idempotent_replay_leaves_state_unchanged() {
        let mut rsi = Rsi::new(14);
        feed_series(&mut rsi, &WILDER_CLOSES);
        let first_pass = rsi.snapshot().expect("snapshot after first pass");

        let updated = feed_series(&mut rsi, &WILDER_CLOSES);
        assert!(updated.iter().all(|&u| !u), "replay must be a no-op");
        assert_eq!(rsi.snapshot().unwrap(), first_pass);
    }

    #[test]
    fn all_gains_read_one_hundred() {
        let mut rsi = Rsi::new(14);
        let closes: Vec<f64> = (1..=20).map(f64::from).collect();
        feed_series(&mut rsi, &closes);

        let snap = rsi.snapshot().unwrap();
        assert!((snap.values["rsi"] - 100.0).abs() < 1e-10);
    }

    #[test]
    fn rsi_stays_in_bounds() {
        let mut rsi = Rsi::new(14);
        let closes: Vec<f64> = (0..60)
            .map(|i| 100.0 + ((i * 37) % 11) as f64 - 5.0)
            .collect();
        for (i, &c) in closes.iter().enumerate() {
            if rsi.update(&candle_at(i as i64, c, true)) {
                let snap = rsi.snapshot().unwrap();
                if let Some(value) = snap.values.get("rsi") {
                    assert!((0.0..=100.0).contains(value), "RSI {value} out of range");
                }
            }
        }
    }

    // ---- load_state ------------------------------------------------------

    #[test]
    fn warm_restart_matches_uninterrupted_run() {
        // Run the full series straight through.
        let mut reference = Rsi::new(14);
        feed_series(&mut reference, &WILDER_CLOSES);

        // Run the first 10, snapshot, restore into a fresh calculator, and
        // finish the series there.
        let mut first_half = Rsi::new(14);
        feed_series(&mut first_half, &WILDER_CLOSES[..10]);
        let saved = first_half.snapshot().expect("mid-warm-up snapshot");

        let mut restored = Rsi::new(14);
        restored.load_state(&saved).expect("snapshot should load");
        for (i, &c) in WILDER_CLOSES.iter().enumerate().skip(10) {
            restored.update(&candle_at(i as i64, c, true));
        }

        let a = reference.snapshot().unwrap();
        let b = restored.snapshot().unwrap();
        assert!((a.values["rsi"] - b.values["rsi"]).abs() < 1e-10);
        assert!((a.values["avg_gain"] - b.values["avg_gain"]).abs() < 1e-10);
        assert!((a.values["avg_loss"] - b.values["avg_loss"]).abs() < 1e-10);
    }

    #[test]
    fn load_state_rejects_wrong_name() {
        let mut rsi = Rsi::new(14);
        let state = IndicatorState {
            name: "macd".into(),
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            start_time: 0,
            end_time: 59_999,
            period: 14,
            values: HashMap::from([("prev_close".into(), 1.0)]),
        };
        assert!(rsi.load_state(&state).is_err());
    }

    #[test]
    fn load_state_rejects_wrong_period() {
        let mut rsi = Rsi::new(14);
        let state = IndicatorState {
            name: "rsi".into(),
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            start_time: 0,
            end_time: 59_999,
            period: 7,
            values: HashMap::from([("prev_close".into(), 1.0)]),
        };
        assert!(rsi.load_state(&state).is_err());
    }

    #[test]
    fn load_state_requires_prev_close() {
        let mut rsi = Rsi::new(14);
        let state = IndicatorState {
            name: "rsi".into(),
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            start_time: 0,
            end_time: 59_999,
            period: 14,
            values: HashMap::new(),
        };
        assert!(rsi.load_state(&state).is_err());
    }

    #[test]
    fn load_state_infers_seeded_from_averages() {
        // A legacy snapshot with averages but no `seeded` marker.
        let mut rsi = Rsi::new(14);
        let state = IndicatorState {
            name: "rsi".into(),
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            start_time: 840_000,
            end_time: 899_999,
            period: 14,
            values: HashMap::from([
                ("prev_close".into(), 46.6875),
                ("avg_gain".into(), 0.5848),
                ("avg_loss".into(), 0.5446),
            ]),
        };
        rsi.load_state(&state).expect("legacy snapshot should load");

        // The next candle must produce a run-phase (Wilder) update.
        assert!(rsi.update(&candle_at(15, 47.0, true)));
        let snap = rsi.snapshot().unwrap();
        assert_eq!(snap.values["seeded"], 1.0);
        assert!(snap.values.contains_key("rsi"));
    }

    #[test]
    fn load_state_rejects_out_of_range_warmup_count() {
        let mut rsi = Rsi::new(14);
        let state = IndicatorState {
            name: "rsi".into(),
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            start_time: 0,
            end_time: 59_999,
            period: 14,
            values: HashMap::from([
                ("prev_close".into(), 46.0),
                ("seeded".into(), 0.0),
                ("sum_gain".into(), 1.0),
                ("sum_loss".into(), 1.0),
                ("warmup_count".into(), 14.0),
            ]),
        };
        assert!(rsi.load_state(&state).is_err());
    }
}
