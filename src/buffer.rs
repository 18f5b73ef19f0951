// =============================================================================
// Stream buffer client — Redis streams with consumer groups
// =============================================================================
//
// Thin wrapper over XADD / XREADGROUP / XACK / XTRIM. The live client owns a
// producer connection, the dispatcher a consumer connection, mirroring the
// split so that a blocking group read never stalls publishes.
//
// No retries happen here: a failed call surfaces as `SyncError::Buffer` and
// the managed connection re-establishes itself lazily, so the caller's next
// attempt goes out on a fresh link.

use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::debug;

use crate::error::SyncError;

/// Stream every raw live frame is appended to.
pub const GLOBAL_KLINES_STREAM: &str = "global_klines_stream";
/// Consumer group the dispatcher drains the global stream through.
pub const GLOBAL_KLINES_GROUP: &str = "global_klines_group";
/// Approximate per-stream retention, in entries.
pub const STREAM_MAX_LEN: usize = 10_000;

/// How long an empty group read blocks before returning, in milliseconds.
const READ_BLOCK_MS: usize = 1000;

/// One entry read from a stream: server-assigned id plus the `data` payload.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub payload: String,
}

/// Client for one logical connection to the stream buffer.
#[derive(Clone)]
pub struct StreamBuffer {
    conn: ConnectionManager,
}

impl StreamBuffer {
    /// Connect to the buffer server. An empty `password` means no AUTH.
    pub async fn connect(host: &str, port: u16, password: Option<&str>) -> Result<Self, SyncError> {
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host.to_string(), port),
            redis: redis::RedisConnectionInfo {
                db: 0,
                username: None,
                password: password.filter(|p| !p.is_empty()).map(str::to_string),
            },
        };
        let client = redis::Client::open(info)?;
        let conn = ConnectionManager::new(client).await?;
        debug!(host, port, "stream buffer connected");
        Ok(Self { conn })
    }

    /// Append `payload` to `stream` under the single field `data`.
    /// Returns the server-assigned entry id.
    pub async fn publish(&self, stream: &str, payload: &str) -> Result<String, SyncError> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", &[("data", payload)]).await?;
        Ok(id)
    }

    /// Read all new entries pending for `consumer` in `group`, blocking
    /// briefly when the stream is empty.
    ///
    /// The group (and the stream, via MKSTREAM) is created lazily on every
    /// call; an already-existing group is not an error.
    pub async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: Option<usize>,
    ) -> Result<Vec<StreamEntry>, SyncError> {
        let mut conn = self.conn.clone();

        let created: Result<String, redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, "$").await;
        if let Err(e) = created {
            // BUSYGROUP = the group already exists, which is the steady state.
            if !e.to_string().contains("BUSYGROUP") {
                return Err(e.into());
            }
        }

        let mut opts = StreamReadOptions::default()
            .group(group, consumer)
            .block(READ_BLOCK_MS);
        if let Some(n) = max_count {
            opts = opts.count(n);
        }

        let reply: StreamReadReply = conn.xread_options(&[stream], &[">"], &opts).await?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let Some(value) = id.map.get("data") else {
                    // An entry without the data field is unusable; skip it so
                    // a malformed producer cannot wedge the group.
                    continue;
                };
                let payload: String = redis::from_redis_value(value)?;
                entries.push(StreamEntry { id: id.id, payload });
            }
        }
        Ok(entries)
    }

    /// Acknowledge one entry, removing it from the group's pending list.
    pub async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), SyncError> {
        let mut conn = self.conn.clone();
        let _acked: i64 = conn.xack(stream, group, &[id]).await?;
        Ok(())
    }

    /// Cap `stream` at approximately `max_len` newest entries.
    pub async fn trim(&self, stream: &str, max_len: usize) -> Result<(), SyncError> {
        let mut conn = self.conn.clone();
        let _removed: i64 = conn.xtrim(stream, StreamMaxlen::Approx(max_len)).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stream naming
// ---------------------------------------------------------------------------

/// Per-pair republish stream: `<sym_lower>-<interval>-stream`.
pub fn pair_stream(symbol: &str, interval: &str) -> String {
    format!("{}-{}-stream", symbol.to_lowercase(), interval)
}

/// Per-pair consumer group: `<sym_lower>-group`.
pub fn pair_group(symbol: &str) -> String {
    format!("{}-group", symbol.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_stream_name_is_lowercased() {
        assert_eq!(pair_stream("BTCUSDT", "15m"), "btcusdt-15m-stream");
    }

    #[test]
    fn pair_group_name_is_lowercased() {
        assert_eq!(pair_group("ETHUSDT"), "ethusdt-group");
    }
}
