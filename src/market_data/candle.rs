// =============================================================================
// Candle model & exchange wire codec
// =============================================================================
//
// Canonical OHLCV candle record plus parsers for the two shapes Binance sends:
//
//   * live-event JSON — `{"e":"kline","E":…,"s":"BTCUSDT","k":{…}}` with
//     short-letter keys and prices as decimal strings;
//   * REST klines — an array of 11-element arrays.
//
// This module has no dependency on storage or streaming; everything else
// depends on it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ParseError;

/// Grace window added to a candle's end time before the wall clock may declare
/// it closed. Absorbs exchange-side close latency and local clock skew.
pub const CLOSE_GRACE_MS: i64 = 1000;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle. Identity is `(symbol, interval, start_time)`.
///
/// All times are UTC milliseconds; `end_time >= start_time`. Prices and
/// volumes are parsed from the exchange's decimal strings into doubles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub interval: String,
    pub start_time: i64,
    pub end_time: i64,
    pub event_time: i64,
    pub first_trade_id: i64,
    pub last_trade_id: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trade_count: i64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
    /// True iff the exchange declared this candle closed.
    pub is_final: bool,
}

impl Candle {
    /// Whether this candle's interval has fully elapsed according to `now_ms`,
    /// with a [`CLOSE_GRACE_MS`] margin past the exchange's end time.
    pub fn is_closed_by(&self, now_ms: i64) -> bool {
        now_ms >= self.end_time + CLOSE_GRACE_MS
    }

    pub fn key(&self) -> CandleKey {
        CandleKey {
            symbol: self.symbol.clone(),
            interval: self.interval.clone(),
        }
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// One frame from the live WebSocket, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// The one-off `{"result":null,"id":1}` subscription acknowledgement.
    SubscriptionAck,
    /// A kline event carrying a candle (final or in-progress).
    Kline(Candle),
    /// Valid JSON that is neither of the above. Logged and dropped upstream.
    Unknown,
}

// ---------------------------------------------------------------------------
// Live-event parsing
// ---------------------------------------------------------------------------

/// Parse one text frame from the kline WebSocket stream.
///
/// Required fields (`s`, `k.t`, `k.T`, `k.i`, `k.x` and the OHLCV price
/// strings) produce a [`ParseError`] naming the field when absent or
/// mistyped. Optional fields (`E`, `f`, `L`, `n`, `q`, `V`, `Q`) default to
/// zero and never abort parsing.
pub fn parse_live_event(text: &str) -> Result<LiveEvent, ParseError> {
    let root: Value = serde_json::from_str(text).map_err(|_| ParseError::malformed("payload"))?;

    // The server acks the subscribe request once: {"result":null,"id":1}.
    if let Some(result) = root.get("result") {
        if result.is_null() {
            return Ok(LiveEvent::SubscriptionAck);
        }
    }

    let k = match root.get("k") {
        Some(Value::Object(_)) => &root["k"],
        Some(_) => return Err(ParseError::wrong_type("k")),
        None => return Ok(LiveEvent::Unknown),
    };

    let symbol = root
        .get("s")
        .ok_or_else(|| ParseError::missing("s"))?
        .as_str()
        .ok_or_else(|| ParseError::wrong_type("s"))?
        .to_uppercase();

    let interval = k
        .get("i")
        .ok_or_else(|| ParseError::missing("k.i"))?
        .as_str()
        .ok_or_else(|| ParseError::wrong_type("k.i"))?
        .to_string();

    let candle = Candle {
        symbol,
        interval,
        start_time: required_i64(k, "t", "k.t")?,
        end_time: required_i64(k, "T", "k.T")?,
        event_time: optional_i64(&root, "E"),
        first_trade_id: optional_i64(k, "f"),
        last_trade_id: optional_i64(k, "L"),
        open: required_price(k, "o", "k.o")?,
        close: required_price(k, "c", "k.c")?,
        high: required_price(k, "h", "k.h")?,
        low: required_price(k, "l", "k.l")?,
        volume: required_price(k, "v", "k.v")?,
        quote_volume: optional_price(k, "q"),
        trade_count: optional_i64(k, "n"),
        taker_buy_volume: optional_price(k, "V"),
        taker_buy_quote_volume: optional_price(k, "Q"),
        is_final: k
            .get("x")
            .ok_or_else(|| ParseError::missing("k.x"))?
            .as_bool()
            .ok_or_else(|| ParseError::wrong_type("k.x"))?,
    };

    Ok(LiveEvent::Kline(candle))
}

/// Serialize a candle back into the live-event JSON shape.
///
/// Round-trippable with [`parse_live_event`] modulo field order: prices are
/// rendered with Rust's shortest-round-trip float formatting, so the parsed
/// values compare equal even when the textual form differs (`"29000.00"` vs
/// `"29000"`).
pub fn serialize(candle: &Candle) -> String {
    serde_json::json!({
        "e": "kline",
        "E": candle.event_time,
        "s": candle.symbol,
        "k": {
            "t": candle.start_time,
            "T": candle.end_time,
            "s": candle.symbol,
            "i": candle.interval,
            "f": candle.first_trade_id,
            "L": candle.last_trade_id,
            "o": format_price(candle.open),
            "c": format_price(candle.close),
            "h": format_price(candle.high),
            "l": format_price(candle.low),
            "v": format_price(candle.volume),
            "n": candle.trade_count,
            "x": candle.is_final,
            "q": format_price(candle.quote_volume),
            "V": format_price(candle.taker_buy_volume),
            "Q": format_price(candle.taker_buy_quote_volume),
        },
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// REST klines parsing
// ---------------------------------------------------------------------------

/// Parse the REST `/api/v3/klines` response: an array of 11-element arrays.
///
/// `symbol` and `interval` are not present in the wire format and must be
/// supplied by the caller. REST candles are marked `is_final = true`; the
/// caller is responsible for dropping the not-yet-elapsed tail via
/// [`Candle::is_closed_by`].
pub fn parse_rest_array(
    body: &str,
    symbol: &str,
    interval: &str,
) -> Result<Vec<Candle>, ParseError> {
    let root: Value = serde_json::from_str(body).map_err(|_| ParseError::malformed("payload"))?;
    let rows = root.as_array().ok_or_else(|| ParseError::wrong_type("payload"))?;

    let symbol = symbol.to_uppercase();
    let mut candles = Vec::with_capacity(rows.len());

    for row in rows {
        let arr = row.as_array().ok_or_else(|| ParseError::wrong_type("kline"))?;
        if arr.len() < 11 {
            return Err(ParseError::malformed("kline"));
        }

        let start_time = arr[0].as_i64().ok_or_else(|| ParseError::wrong_type("kline[0]"))?;

        candles.push(Candle {
            symbol: symbol.clone(),
            interval: interval.to_string(),
            start_time,
            end_time: arr[6].as_i64().ok_or_else(|| ParseError::wrong_type("kline[6]"))?,
            // The REST shape carries no event metadata.
            event_time: start_time,
            first_trade_id: 0,
            last_trade_id: 0,
            open: price_at(arr, 1)?,
            high: price_at(arr, 2)?,
            low: price_at(arr, 3)?,
            close: price_at(arr, 4)?,
            volume: price_at(arr, 5)?,
            quote_volume: price_at(arr, 7)?,
            trade_count: arr[8].as_i64().ok_or_else(|| ParseError::wrong_type("kline[8]"))?,
            taker_buy_volume: price_at(arr, 9)?,
            taker_buy_quote_volume: price_at(arr, 10)?,
            is_final: true,
        });
    }

    Ok(candles)
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// Binance sends numeric values as JSON strings inside kline objects; tolerate
/// a bare number as well.
fn price_value(val: &Value) -> Option<f64> {
    match val {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn required_price(obj: &Value, key: &str, field: &'static str) -> Result<f64, ParseError> {
    let val = obj.get(key).ok_or_else(|| ParseError::missing(field))?;
    price_value(val).ok_or_else(|| ParseError::wrong_type(field))
}

fn optional_price(obj: &Value, key: &str) -> f64 {
    obj.get(key).and_then(price_value).unwrap_or(0.0)
}

fn required_i64(obj: &Value, key: &str, field: &'static str) -> Result<i64, ParseError> {
    obj.get(key)
        .ok_or_else(|| ParseError::missing(field))?
        .as_i64()
        .ok_or_else(|| ParseError::wrong_type(field))
}

fn optional_i64(obj: &Value, key: &str) -> i64 {
    obj.get(key).and_then(Value::as_i64).unwrap_or(0)
}

const PRICE_NEEDS_DECIMALS: f64 = 1e-8;

fn price_at(arr: &[Value], idx: usize) -> Result<f64, ParseError> {
    const FIELDS: [&str; 11] = [
        "kline[0]", "kline[1]", "kline[2]", "kline[3]", "kline[4]", "kline[5]", "kline[6]",
        "kline[7]", "kline[8]", "kline[9]", "kline[10]",
    ];
    price_value(&arr[idx]).ok_or_else(|| ParseError::wrong_type(FIELDS[idx]))
}

/// Render a price as a decimal string the way the exchange does.
///
/// Shortest representation that round-trips through `f64::parse`; values
/// below 1e-8 collapse to "0" which matches the exchange's own precision
/// floor.
fn format_price(value: f64) -> String {
    if value.abs() < PRICE_NEEDS_DECIMALS {
        "0".to_string()
    } else {
        format!("{value}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
