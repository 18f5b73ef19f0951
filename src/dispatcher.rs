// =============================================================================
// Dispatcher — drains the global stream, drives indicators and storage
// =============================================================================
//
// Single worker. Each cycle reads everything new from the global stream,
// splits it by `(symbol, interval)`, republishes raw frames to the per-pair
// fan-out streams, and hands closed candles -- sorted ascending by start time
// within each pair -- to the indicator engine and the store.
//
// Ordering: the per-pair sort plus the engine's per-pair serialization give
// indicators a strictly increasing view of start times regardless of how
// frames interleaved on the wire.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::buffer::{
    pair_stream, StreamBuffer, GLOBAL_KLINES_GROUP, GLOBAL_KLINES_STREAM, STREAM_MAX_LEN,
};
use crate::indicators::IndicatorEngine;
use crate::market_data::{self, Candle, LiveEvent};
use crate::store::{MongoStore, DB_MARKET_INFO};

/// Consumer name this dispatcher claims within the global group.
pub const GLOBAL_CONSUMER: &str = "consumer1";

/// Idle sleep between cycles when the stream had nothing new.
const IDLE_SLEEP: Duration = Duration::from_secs(1);

pub struct Dispatcher {
    buffer: StreamBuffer,
    store: MongoStore,
    engine: Arc<IndicatorEngine>,
}

impl Dispatcher {
    pub fn new(buffer: StreamBuffer, store: MongoStore, engine: Arc<IndicatorEngine>) -> Self {
        Self {
            buffer,
            store,
            engine,
        }
    }

    /// Run the dispatch loop forever. Errors fail the cycle, not the loop.
    pub async fn run(&self) {
        info!("dispatcher starting");
        loop {
            match self.drain_once().await {
                Ok(0) => tokio::time::sleep(IDLE_SLEEP).await,
                Ok(candles) => debug!(candles, "dispatch cycle complete"),
                Err(e) => {
                    warn!(error = %e, "dispatch cycle failed");
                    tokio::time::sleep(IDLE_SLEEP).await;
                }
            }
        }
    }

    /// One full cycle. Returns the number of closed candles processed.
    async fn drain_once(&self) -> Result<usize> {
        let entries = self
            .buffer
            .read_group(
                GLOBAL_KLINES_STREAM,
                GLOBAL_KLINES_GROUP,
                GLOBAL_CONSUMER,
                None,
            )
            .await?;
        if entries.is_empty() {
            return Ok(0);
        }
        debug!(entries = entries.len(), "global stream batch fetched");

        let mut closed = Vec::new();
        for entry in &entries {
            match market_data::parse_live_event(&entry.payload) {
                Ok(LiveEvent::SubscriptionAck) => {
                    self.ack_entry(&entry.id).await;
                }
                Ok(LiveEvent::Kline(candle)) => {
                    // Fan-out point: downstream consumers read the per-pair
                    // streams; the core only writes and trims them.
                    let stream = pair_stream(&candle.symbol, &candle.interval);
                    if let Err(e) = self.buffer.publish(&stream, &entry.payload).await {
                        warn!(stream = %stream, error = %e, "per-pair republish failed");
                    }
                    if let Err(e) = self.buffer.trim(&stream, STREAM_MAX_LEN).await {
                        warn!(stream = %stream, error = %e, "per-pair trim failed");
                    }

                    if candle.is_final {
                        closed.push(candle);
                    }
                    self.ack_entry(&entry.id).await;
                }
                Ok(LiveEvent::Unknown) => {
                    debug!("unrecognized frame dropped");
                    self.ack_entry(&entry.id).await;
                }
                Err(e) => {
                    // A poison frame must not wedge the consumer group.
                    warn!(error = %e, "unparseable frame skipped");
                    self.ack_entry(&entry.id).await;
                }
            }
        }

        if let Err(e) = self.buffer.trim(GLOBAL_KLINES_STREAM, STREAM_MAX_LEN).await {
            warn!(error = %e, "global stream trim failed");
        }

        let total = closed.len();
        for ((symbol, interval), group) in bucket_and_sort(closed) {
            for candle in &group {
                if let Err(e) = self.engine.process_new_candle(candle).await {
                    warn!(
                        symbol = %symbol,
                        interval = %interval,
                        starttime = candle.start_time,
                        error = %e,
                        "indicator update failed"
                    );
                }
            }
            if let Err(e) = self.store.bulk_upsert_closed(DB_MARKET_INFO, &group).await {
                warn!(
                    symbol = %symbol,
                    interval = %interval,
                    batch = group.len(),
                    error = %e,
                    "candle batch upsert failed"
                );
            }
        }
        Ok(total)
    }

    async fn ack_entry(&self, id: &str) {
        if let Err(e) = self
            .buffer
            .ack(GLOBAL_KLINES_STREAM, GLOBAL_KLINES_GROUP, id)
            .await
        {
            warn!(id, error = %e, "failed to ack global stream entry");
        }
    }
}

/// Group candles by pair, each group sorted ascending by start time.
fn bucket_and_sort(candles: Vec<Candle>) -> BTreeMap<(String, String), Vec<Candle>> {
    let mut buckets: BTreeMap<(String, String), Vec<Candle>> = BTreeMap::new();
    for candle in candles {
        buckets
            .entry((candle.symbol.clone(), candle.interval.clone()))
            .or_default()
            .push(candle);
    }
    for group in buckets.values_mut() {
        group.sort_by_key(|c| c.start_time);
    }
    buckets
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(symbol: &str, interval: &str, start: i64) -> Candle {
        Candle {
            symbol: symbol.into(),
            interval: interval.into(),
            start_time: start,
            end_time: start + 59_999,
            event_time: start,
            first_trade_id: 0,
            last_trade_id: 0,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            quote_volume: 1.0,
            trade_count: 1,
            taker_buy_volume: 0.0,
            taker_buy_quote_volume: 0.0,
            is_final: true,
        }
    }

    #[test]
    fn bucket_and_sort_groups_by_pair() {
        let batch = vec![
            candle("ETHUSDT", "1m", 120_000),
            candle("BTCUSDT", "1m", 60_000),
            candle("BTCUSDT", "15m", 0),
            candle("BTCUSDT", "1m", 0),
        ];
        let buckets = bucket_and_sort(batch);

        let key = |s: &str, i: &str| (s.to_string(), i.to_string());
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[&key("BTCUSDT", "1m")].len(), 2);
        assert_eq!(buckets[&key("BTCUSDT", "15m")].len(), 1);
        assert_eq!(buckets[&key("ETHUSDT", "1m")].len(), 1);
    }

    #[test]
    fn bucket_groups_are_sorted_ascending() {
        let batch = vec![
            candle("BTCUSDT", "1m", 180_000),
            candle("BTCUSDT", "1m", 0),
            candle("BTCUSDT", "1m", 120_000),
            candle("BTCUSDT", "1m", 60_000),
        ];
        let buckets = bucket_and_sort(batch);
        let key = ("BTCUSDT".to_string(), "1m".to_string());
        let starts: Vec<i64> = buckets[&key].iter().map(|c| c.start_time).collect();
        assert_eq!(starts, vec![0, 60_000, 120_000, 180_000]);
    }
}
