pub mod candle;

// Re-export the candle types for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle::{parse_live_event, parse_rest_array, serialize, Candle, CandleKey, LiveEvent};
