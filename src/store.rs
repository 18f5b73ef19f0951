// =============================================================================
// Document store client — candle collections & indicator state
// =============================================================================
//
// Collection layout (one collection per pair, per exchange):
//
//   market_info.<SYMBOL>_<interval>_Binance      candles, keyed by starttime
//   indicators.<name>_<period>_<SYMBOL>_<interval>_Binance
//
// Candles are immutable once written; upserts exist only to absorb duplicate
// delivery, so a second upsert with the same starttime is a no-op update.

use std::collections::BTreeMap;

use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{FindOneOptions, FindOptions, UpdateOptions};
use mongodb::Client;
use futures_util::TryStreamExt;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::indicators::IndicatorState;
use crate::market_data::Candle;

/// Database holding per-pair candle collections.
pub const DB_MARKET_INFO: &str = "market_info";
/// Database holding per-calculator indicator state collections.
pub const DB_INDICATORS: &str = "indicators";

/// Candle collection name for one `(symbol, interval)` pair.
pub fn market_collection(symbol: &str, interval: &str) -> String {
    format!("{}_{}_Binance", symbol.to_uppercase(), interval)
}

/// Indicator-state collection name for one calculator on one pair.
pub fn indicator_collection(name: &str, period: u32, symbol: &str, interval: &str) -> String {
    format!(
        "{}_{}_{}_{}_Binance",
        name,
        period,
        symbol.to_uppercase(),
        interval
    )
}

/// Handle to the document store. The underlying driver client is internally
/// pooled; cloning shares the pool.
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
}

impl MongoStore {
    pub async fn connect(uri: &str) -> Result<Self, SyncError> {
        let client = Client::with_uri_str(uri).await?;
        Ok(Self { client })
    }

    // -------------------------------------------------------------------------
    // Candle reads
    // -------------------------------------------------------------------------

    /// `(start_time, end_time)` of the newest stored candle, or `(0, 0)` when
    /// the collection is empty.
    pub async fn latest_synced_range(
        &self,
        db: &str,
        collection: &str,
    ) -> Result<(i64, i64), SyncError> {
        let col = self.client.database(db).collection::<Document>(collection);
        let opts = FindOneOptions::builder()
            .sort(doc! { "starttime": -1 })
            .build();

        match col.find_one(None, opts).await? {
            Some(d) => {
                let start = bson_i64(&d, "starttime").unwrap_or(0);
                let end = bson_i64(&d, "endtime").unwrap_or(0);
                Ok((start, end))
            }
            None => Ok((0, 0)),
        }
    }

    /// The newest `limit` candles with `starttime <= upper_bound` (no bound
    /// when `None`), returned oldest-first.
    pub async fn latest_n_descending(
        &self,
        db: &str,
        collection: &str,
        upper_bound: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Candle>, SyncError> {
        let col = self.client.database(db).collection::<Document>(collection);
        let filter = upper_bound.map(|end| doc! { "starttime": { "$lte": end } });
        let opts = FindOptions::builder()
            .sort(doc! { "starttime": -1 })
            .limit(limit)
            .build();

        let mut cursor = col.find(filter, opts).await?;
        let mut candles = Vec::new();
        while let Some(d) = cursor.try_next().await? {
            match candle_from_doc(&d) {
                Ok(c) => candles.push(c),
                Err(e) => warn!(collection, error = %e, "skipping unreadable candle document"),
            }
        }
        candles.reverse();
        Ok(candles)
    }

    /// Candles with `starttime` in `[from, to]`, sorted by `starttime` in the
    /// given order (`1` ascending, `-1` descending), capped at `limit`.
    pub async fn range(
        &self,
        db: &str,
        collection: &str,
        from: i64,
        to: i64,
        limit: i64,
        order: i32,
    ) -> Result<Vec<Candle>, SyncError> {
        let col = self.client.database(db).collection::<Document>(collection);
        let filter = doc! { "starttime": { "$gte": from, "$lte": to } };
        let opts = FindOptions::builder()
            .sort(doc! { "starttime": order })
            .limit(limit)
            .build();

        let mut cursor = col.find(filter, opts).await?;
        let mut candles = Vec::new();
        while let Some(d) = cursor.try_next().await? {
            match candle_from_doc(&d) {
                Ok(c) => candles.push(c),
                Err(e) => warn!(collection, error = %e, "skipping unreadable candle document"),
            }
        }
        Ok(candles)
    }

    // -------------------------------------------------------------------------
    // Candle writes
    // -------------------------------------------------------------------------

    /// Upsert a batch of closed candles, bucketed into their per-pair
    /// collections.
    ///
    /// Each document is matched by `starttime` and `$set` in full. A failure
    /// on one document is logged and does not abort the rest of the batch.
    pub async fn bulk_upsert_closed(&self, db: &str, candles: &[Candle]) -> Result<(), SyncError> {
        if candles.is_empty() {
            return Ok(());
        }

        let mut buckets: BTreeMap<String, Vec<&Candle>> = BTreeMap::new();
        for c in candles {
            buckets
                .entry(market_collection(&c.symbol, &c.interval))
                .or_default()
                .push(c);
        }

        for (collection, group) in buckets {
            let col = self.client.database(db).collection::<Document>(&collection);
            let mut upserted = 0usize;
            let mut matched = 0usize;
            let mut failed = 0usize;

            for c in &group {
                let filter = doc! { "starttime": c.start_time };
                let update = doc! { "$set": candle_doc(c) };
                let opts = UpdateOptions::builder().upsert(true).build();

                match col.update_one(filter, update, opts).await {
                    Ok(res) => {
                        if res.upserted_id.is_some() {
                            upserted += 1;
                        } else {
                            matched += 1;
                        }
                    }
                    Err(e) => {
                        failed += 1;
                        warn!(
                            collection = %collection,
                            starttime = c.start_time,
                            error = %e,
                            "candle upsert failed"
                        );
                    }
                }
            }

            info!(
                collection = %collection,
                total = group.len(),
                upserted,
                matched,
                failed,
                "candle batch upserted"
            );
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Indicator state
    // -------------------------------------------------------------------------

    /// The stored indicator state with the largest `starttime`, if any.
    pub async fn read_indicator_latest(
        &self,
        db: &str,
        collection: &str,
    ) -> Result<Option<IndicatorState>, SyncError> {
        let col = self.client.database(db).collection::<Document>(collection);
        let opts = FindOneOptions::builder()
            .sort(doc! { "starttime": -1 })
            .build();

        let Some(d) = col.find_one(None, opts).await? else {
            return Ok(None);
        };

        let mut state = IndicatorState {
            name: d.get_str("name").unwrap_or_default().to_string(),
            symbol: d.get_str("symbol").unwrap_or_default().to_string(),
            interval: d.get_str("interval").unwrap_or_default().to_string(),
            start_time: bson_i64(&d, "starttime").unwrap_or(0),
            end_time: bson_i64(&d, "endtime").unwrap_or(0),
            period: bson_f64(&d, "period").unwrap_or(0.0) as u32,
            values: Default::default(),
        };

        // Every non-fixed numeric field lands in the sparse value map.
        for (key, value) in d.iter() {
            if is_fixed_indicator_field(key) {
                continue;
            }
            if let Some(v) = numeric_bson(value) {
                state.values.insert(key.clone(), v);
            }
        }

        debug!(collection, starttime = state.start_time, "indicator state loaded");
        Ok(Some(state))
    }

    /// Upsert one indicator state document, keyed by `starttime`.
    pub async fn write_indicator_state(
        &self,
        db: &str,
        collection: &str,
        state: &IndicatorState,
    ) -> Result<(), SyncError> {
        let col = self.client.database(db).collection::<Document>(collection);

        let mut d = doc! {
            "starttime": state.start_time,
            "endtime": state.end_time,
            "name": &state.name,
            "period": state.period as i64,
            "symbol": &state.symbol,
            "interval": &state.interval,
        };
        for (key, value) in &state.values {
            d.insert(key.clone(), *value);
        }

        let filter = doc! { "starttime": state.start_time };
        let opts = UpdateOptions::builder().upsert(true).build();
        col.update_one(filter, doc! { "$set": d }, opts).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Document mapping
// ---------------------------------------------------------------------------

fn is_fixed_indicator_field(key: &str) -> bool {
    matches!(
        key,
        "_id" | "starttime" | "endtime" | "name" | "period" | "symbol" | "interval"
    )
}

fn candle_doc(c: &Candle) -> Document {
    doc! {
        "eventtype": "kline",
        "eventtime": c.event_time,
        "symbol": &c.symbol,
        "starttime": c.start_time,
        "endtime": c.end_time,
        "interval": &c.interval,
        "firsttradeid": c.first_trade_id,
        "lasttradeid": c.last_trade_id,
        "open": c.open,
        "high": c.high,
        "low": c.low,
        "close": c.close,
        "volume": c.volume,
        "tradenum": c.trade_count,
        "isfinal": c.is_final,
        "quotevolume": c.quote_volume,
        "activebuyvolume": c.taker_buy_volume,
        "activebuyquotevolume": c.taker_buy_quote_volume,
    }
}

fn candle_from_doc(d: &Document) -> Result<Candle, SyncError> {
    let start_time = bson_i64(d, "starttime")
        .ok_or_else(|| SyncError::Protocol("candle document missing starttime".into()))?;

    Ok(Candle {
        symbol: d.get_str("symbol").unwrap_or_default().to_string(),
        interval: d.get_str("interval").unwrap_or_default().to_string(),
        start_time,
        end_time: bson_i64(d, "endtime").unwrap_or(0),
        event_time: bson_i64(d, "eventtime").unwrap_or(0),
        first_trade_id: bson_i64(d, "firsttradeid").unwrap_or(0),
        last_trade_id: bson_i64(d, "lasttradeid").unwrap_or(0),
        open: bson_f64(d, "open").unwrap_or(0.0),
        high: bson_f64(d, "high").unwrap_or(0.0),
        low: bson_f64(d, "low").unwrap_or(0.0),
        close: bson_f64(d, "close").unwrap_or(0.0),
        volume: bson_f64(d, "volume").unwrap_or(0.0),
        quote_volume: bson_f64(d, "quotevolume").unwrap_or(0.0),
        trade_count: bson_i64(d, "tradenum").unwrap_or(0),
        taker_buy_volume: bson_f64(d, "activebuyvolume").unwrap_or(0.0),
        taker_buy_quote_volume: bson_f64(d, "activebuyquotevolume").unwrap_or(0.0),
        is_final: d.get_bool("isfinal").unwrap_or(true),
    })
}

/// Coerce any BSON numeric representation (plus legacy decimal strings) into
/// an `f64`.
fn numeric_bson(value: &Bson) -> Option<f64> {
    match value {
        Bson::Double(v) => Some(*v),
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Decimal128(v) => v.to_string().parse().ok(),
        Bson::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn bson_f64(d: &Document, key: &str) -> Option<f64> {
    d.get(key).and_then(numeric_bson)
}

fn bson_i64(d: &Document, key: &str) -> Option<i64> {
    match d.get(key) {
        Some(Bson::Int64(v)) => Some(*v),
        Some(Bson::Int32(v)) => Some(i64::from(*v)),
        Some(Bson::Double(v)) => Some(*v as i64),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_candle() -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            interval: "15m".into(),
            start_time: 1690848000000,
            end_time: 1690848899999,
            event_time: 1690848899000,
            first_trade_id: 100,
            last_trade_id: 200,
            open: 29000.0,
            high: 29200.0,
            low: 28950.0,
            close: 29100.5,
            volume: 10.0,
            quote_volume: 291000.12,
            trade_count: 1500,
            taker_buy_volume: 6.5,
            taker_buy_quote_volume: 189000.44,
            is_final: true,
        }
    }

    #[test]
    fn collection_names() {
        assert_eq!(market_collection("btcusdt", "15m"), "BTCUSDT_15m_Binance");
        assert_eq!(
            indicator_collection("rsi", 14, "ethusdt", "1h"),
            "rsi_14_ETHUSDT_1h_Binance"
        );
    }

    #[test]
    fn candle_document_round_trip() {
        let candle = sample_candle();
        let d = candle_doc(&candle);
        assert_eq!(d.get_i64("starttime").unwrap(), candle.start_time);
        assert_eq!(d.get_str("symbol").unwrap(), "BTCUSDT");

        let back = candle_from_doc(&d).expect("document should map back");
        assert_eq!(back, candle);
    }

    #[test]
    fn numeric_coercion_accepts_all_wire_types() {
        assert_eq!(numeric_bson(&Bson::Double(1.5)), Some(1.5));
        assert_eq!(numeric_bson(&Bson::Int32(7)), Some(7.0));
        assert_eq!(numeric_bson(&Bson::Int64(9)), Some(9.0));
        assert_eq!(numeric_bson(&Bson::String("2.25".into())), Some(2.25));
        assert_eq!(numeric_bson(&Bson::Boolean(true)), None);
    }

    #[test]
    fn missing_starttime_is_an_error() {
        let d = doc! { "symbol": "BTCUSDT" };
        assert!(candle_from_doc(&d).is_err());
    }

    #[test]
    fn fixed_indicator_fields_are_excluded_from_value_map() {
        assert!(is_fixed_indicator_field("_id"));
        assert!(is_fixed_indicator_field("starttime"));
        assert!(is_fixed_indicator_field("period"));
        assert!(!is_fixed_indicator_field("avg_gain"));
        assert!(!is_fixed_indicator_field("rsi"));
    }
}
