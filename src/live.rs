// =============================================================================
// Live kline client — single WebSocket, reconnect state machine
// =============================================================================
//
// One TLS WebSocket to the exchange carries every configured
// `<symbol>@kline_<interval>` subscription. A single task owns the socket;
// its `select!` loop is the serialization point for the read path, the
// keep-alive ping, and the idle watchdog, so none of them ever run
// concurrently.
//
// Lifecycle: Idle -> Connecting -> Subscribed -> Running, then back through
// Reconnecting (fixed 5 s back-off) on any socket failure, forever. After a
// successful reconnect a single detached history gap-fill closes whatever the
// outage left behind; repeated reconnects coalesce into one sweep through the
// shared once-flag.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{
    connect_async, connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::buffer::{StreamBuffer, GLOBAL_KLINES_STREAM};
use crate::history::HistorySync;

const WS_URL: &str = "wss://stream.binance.com:9443/ws";

/// Fixed back-off between a session ending and the next connect attempt.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Keep-alive ping cadence while the stream is running.
const PING_INTERVAL: Duration = Duration::from_secs(600);
/// No frame for two ping periods means the link is dead even if the socket
/// has not noticed.
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(1200);

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Connection lifecycle of the live client. The machine has no terminal
/// state; it cycles through `Reconnecting` for as long as the process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Subscribed,
    Running,
    Reconnecting,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Subscribed => write!(f, "Subscribed"),
            Self::Running => write!(f, "Running"),
            Self::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct LiveClient {
    buffer: StreamBuffer,
    history: Arc<HistorySync>,
    symbols: Vec<String>,
    intervals: Vec<String>,
    danger_accept_invalid_certs: bool,
    /// Shared once-flag guarding the post-reconnect gap-fill sweep.
    gap_fill_in_flight: Arc<AtomicBool>,
}

impl LiveClient {
    pub fn new(
        buffer: StreamBuffer,
        history: Arc<HistorySync>,
        symbols: Vec<String>,
        intervals: Vec<String>,
        danger_accept_invalid_certs: bool,
    ) -> Self {
        Self {
            buffer,
            history,
            symbols,
            intervals,
            danger_accept_invalid_certs,
            gap_fill_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the live client forever.
    pub async fn run(&self) {
        let mut state = SessionState::Idle;
        info!(state = %state, "live client starting");

        let mut sessions = 0u64;
        loop {
            match self.run_session(sessions > 0).await {
                Ok(()) => warn!("live stream ended by server"),
                Err(e) => error!(error = %e, "live session failed"),
            }
            sessions += 1;

            state = SessionState::Reconnecting;
            info!(
                state = %state,
                delay_secs = RECONNECT_DELAY.as_secs(),
                "waiting before reconnect"
            );
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    /// One connection lifecycle: connect, subscribe, stream until failure.
    ///
    /// Returning (Ok or Err) tears the socket down; the in-flight read and
    /// ping futures are dropped with it, so a dying session can never
    /// re-enter the reconnect path twice.
    async fn run_session(&self, is_reconnect: bool) -> Result<()> {
        let mut state = SessionState::Connecting;
        info!(state = %state, url = WS_URL, "connecting to kline WebSocket");

        let ws_stream = self.connect().await?;
        let (mut write, mut read) = ws_stream.split();

        let frame = subscribe_frame(&self.symbols, &self.intervals);
        write
            .send(Message::Text(frame))
            .await
            .context("failed to send subscribe frame")?;
        state = SessionState::Subscribed;
        info!(
            state = %state,
            symbols = ?self.symbols,
            intervals = ?self.intervals,
            "subscription sent"
        );

        // The first frame is the server's subscribe ack; it is published like
        // any other so the dispatcher can recognize and discard it.
        let first = read
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("stream ended before first frame"))?
            .context("read failed before first frame")?;
        self.handle_frame(first, &mut write).await?;

        state = SessionState::Running;
        info!(state = %state, "live stream running");

        if is_reconnect {
            // The socket was down for at least the back-off window; close the
            // gap in stored history while live frames resume flowing.
            self.history.spawn_gap_fill(&self.gap_fill_in_flight);
        }

        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + PING_INTERVAL,
            PING_INTERVAL,
        );
        let mut last_frame = tokio::time::Instant::now();

        loop {
            tokio::select! {
                msg = read.next() => {
                    let msg = msg
                        .ok_or_else(|| anyhow::anyhow!("WebSocket stream ended"))?
                        .context("WebSocket read error")?;
                    last_frame = tokio::time::Instant::now();
                    self.handle_frame(msg, &mut write).await?;
                }
                _ = ping.tick() => {
                    let idle = last_frame.elapsed();
                    if idle >= WATCHDOG_TIMEOUT {
                        anyhow::bail!("watchdog: no frame for {}s", idle.as_secs());
                    }
                    write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .context("keep-alive ping send failed")?;
                    debug!("keep-alive ping sent");
                }
            }
        }
    }

    async fn connect(&self) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        if self.danger_accept_invalid_certs {
            warn!("TLS certificate validation is DISABLED (tls.danger_accept_invalid_certs)");
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .build()
                .context("failed to build TLS connector")?;
            let (ws, _response) = connect_async_tls_with_config(
                WS_URL,
                None,
                false,
                Some(Connector::NativeTls(tls)),
            )
            .await
            .context("failed to connect to kline WebSocket")?;
            Ok(ws)
        } else {
            let (ws, _response) = connect_async(WS_URL)
                .await
                .context("failed to connect to kline WebSocket")?;
            Ok(ws)
        }
    }

    /// Handle one received frame. Text frames are republished verbatim into
    /// the global stream -- no per-candle work happens on the live path.
    async fn handle_frame<S>(&self, msg: Message, write: &mut S) -> Result<()>
    where
        S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        match msg {
            Message::Text(text) => {
                if let Err(e) = self.buffer.publish(GLOBAL_KLINES_STREAM, &text).await {
                    // A dropped frame is recoverable: the gap-fill sweep will
                    // restore it from REST after the next reconnect.
                    warn!(error = %e, "failed to publish frame to buffer");
                }
            }
            Message::Ping(payload) => {
                write
                    .send(Message::Pong(payload))
                    .await
                    .context("pong send failed")?;
            }
            Message::Close(frame) => {
                anyhow::bail!("server closed connection: {frame:?}");
            }
            // Pong / Binary / raw frames carry nothing for us.
            _ => {}
        }
        Ok(())
    }
}

/// Build the one-shot subscribe frame covering every configured pair.
fn subscribe_frame(symbols: &[String], intervals: &[String]) -> String {
    let params: Vec<String> = symbols
        .iter()
        .flat_map(|symbol| {
            let lower = symbol.to_lowercase();
            intervals
                .iter()
                .map(move |interval| format!("{lower}@kline_{interval}"))
        })
        .collect();

    serde_json::json!({
        "method": "SUBSCRIBE",
        "params": params,
        "id": 1,
    })
    .to_string()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frame_covers_cross_product() {
        let frame = subscribe_frame(
            &["BTCUSDT".to_string(), "ethusdt".to_string()],
            &["1m".to_string(), "15m".to_string()],
        );
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(parsed["method"], "SUBSCRIBE");
        assert_eq!(parsed["id"], 1);

        let params: Vec<&str> = parsed["params"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(
            params,
            vec![
                "btcusdt@kline_1m",
                "btcusdt@kline_15m",
                "ethusdt@kline_1m",
                "ethusdt@kline_15m",
            ]
        );
    }

    #[test]
    fn session_state_display() {
        assert_eq!(SessionState::Connecting.to_string(), "Connecting");
        assert_eq!(SessionState::Reconnecting.to_string(), "Reconnecting");
    }
}
