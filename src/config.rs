// =============================================================================
// Configuration — config.ini in the working directory
// =============================================================================
//
// Sections:
//
//   [database]   uri (host/port/username/password are reserved; the driver
//                takes the full URI)
//   [redis]      host, port, password (empty password = no AUTH)
//   [marketsub]  symbols, intervals (comma-separated), backfill_start_ms
//   [tls]        danger_accept_invalid_certs (default false)
//
// `backfill_start_ms` is deliberately required: earlier builds of this system
// shipped with divergent hard-coded epochs, so the operator states it.

use config::{Config, File, FileFormat};
use tracing::debug;

use crate::error::SyncError;

/// Fully validated runtime configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Document-store connection URI.
    pub database_uri: String,

    pub redis_host: String,
    pub redis_port: u16,
    /// `None` when the buffer server runs without AUTH.
    pub redis_password: Option<String>,

    /// Trading pairs to sync, as configured (lowercased for subscriptions,
    /// uppercased for storage and REST at the point of use).
    pub symbols: Vec<String>,
    /// Kline intervals to sync (e.g. "1m", "15m", "1h").
    pub intervals: Vec<String>,
    /// UTC-millisecond epoch history back-fill starts from when a pair
    /// collection is empty.
    pub backfill_start_ms: i64,

    /// Disable TLS certificate validation (development only).
    pub danger_accept_invalid_certs: bool,
}

impl SyncConfig {
    /// Load and validate configuration from an INI file at `path`.
    pub fn load(path: &str) -> Result<Self, SyncError> {
        let cfg = Config::builder()
            .add_source(File::new(path, FileFormat::Ini))
            .build()
            .map_err(|e| SyncError::Config(format!("failed to read {path}: {e}")))?;
        Self::from_config(&cfg)
    }

    fn from_config(cfg: &Config) -> Result<Self, SyncError> {
        let database_uri = require_string(cfg, "database.uri")?;

        // Reserved discrete credential keys; noted but not used while the
        // full URI carries the credentials.
        if cfg.get_string("database.host").is_ok() {
            debug!("database.host present (reserved; uri takes precedence)");
        }

        let redis_host = require_string(cfg, "redis.host")?;
        let redis_port = cfg
            .get_int("redis.port")
            .map_err(|e| SyncError::Config(format!("redis.port: {e}")))?;
        let redis_port = u16::try_from(redis_port)
            .map_err(|_| SyncError::Config(format!("redis.port {redis_port} out of range")))?;
        let redis_password = cfg
            .get_string("redis.password")
            .ok()
            .filter(|p| !p.is_empty());

        let symbols = split_list(&require_string(cfg, "marketsub.symbols")?);
        if symbols.is_empty() {
            return Err(SyncError::Config("marketsub.symbols is empty".into()));
        }
        let intervals = split_list(&require_string(cfg, "marketsub.intervals")?);
        if intervals.is_empty() {
            return Err(SyncError::Config("marketsub.intervals is empty".into()));
        }

        let backfill_start_ms = cfg.get_int("marketsub.backfill_start_ms").map_err(|_| {
            SyncError::Config("marketsub.backfill_start_ms is required (UTC milliseconds)".into())
        })?;
        if backfill_start_ms <= 0 {
            return Err(SyncError::Config(
                "marketsub.backfill_start_ms must be positive".into(),
            ));
        }

        let danger_accept_invalid_certs = cfg
            .get_bool("tls.danger_accept_invalid_certs")
            .unwrap_or(false);

        Ok(Self {
            database_uri,
            redis_host,
            redis_port,
            redis_password,
            symbols,
            intervals,
            backfill_start_ms,
            danger_accept_invalid_certs,
        })
    }
}

fn require_string(cfg: &Config, key: &str) -> Result<String, SyncError> {
    let value = cfg
        .get_string(key)
        .map_err(|_| SyncError::Config(format!("missing required key {key}")))?;
    if value.trim().is_empty() {
        return Err(SyncError::Config(format!("key {key} is empty")));
    }
    Ok(value)
}

/// Split a comma-separated config value into trimmed, non-empty tokens.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const FULL_INI: &str = r#"
[database]
uri = mongodb://localhost:27017

[redis]
host = 127.0.0.1
port = 6379
password =

[marketsub]
symbols = btcusdt, ethusdt
intervals = 1m,15m,1h
backfill_start_ms = 1690848000000

[tls]
danger_accept_invalid_certs = false
"#;

    fn parse(ini: &str) -> Result<SyncConfig, SyncError> {
        let cfg = Config::builder()
            .add_source(File::from_str(ini, FileFormat::Ini))
            .build()
            .expect("ini should be well-formed");
        SyncConfig::from_config(&cfg)
    }

    #[test]
    fn full_config_loads() {
        let cfg = parse(FULL_INI).expect("config should load");
        assert_eq!(cfg.database_uri, "mongodb://localhost:27017");
        assert_eq!(cfg.redis_host, "127.0.0.1");
        assert_eq!(cfg.redis_port, 6379);
        assert_eq!(cfg.redis_password, None); // empty = no AUTH
        assert_eq!(cfg.symbols, vec!["btcusdt", "ethusdt"]);
        assert_eq!(cfg.intervals, vec!["1m", "15m", "1h"]);
        assert_eq!(cfg.backfill_start_ms, 1690848000000);
        assert!(!cfg.danger_accept_invalid_certs);
    }

    #[test]
    fn backfill_epoch_is_required() {
        let without_epoch = FULL_INI.replace("backfill_start_ms = 1690848000000", "");
        let err = parse(&without_epoch).expect_err("must fail");
        assert!(err.to_string().contains("backfill_start_ms"));
    }

    #[test]
    fn missing_symbols_is_an_error() {
        let broken = FULL_INI.replace("symbols = btcusdt, ethusdt", "symbols = ,");
        assert!(parse(&broken).is_err());
    }

    #[test]
    fn redis_password_is_kept_when_set() {
        let with_pass = FULL_INI.replace("password =", "password = hunter2");
        let cfg = parse(&with_pass).expect("config should load");
        assert_eq!(cfg.redis_password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn danger_flag_opt_in() {
        let insecure = FULL_INI.replace(
            "danger_accept_invalid_certs = false",
            "danger_accept_invalid_certs = true",
        );
        let cfg = parse(&insecure).expect("config should load");
        assert!(cfg.danger_accept_invalid_certs);
    }

    #[test]
    fn list_splitting_trims_whitespace() {
        assert_eq!(split_list(" a , b ,, c "), vec!["a", "b", "c"]);
        assert!(split_list(" , ").is_empty());
    }
}
