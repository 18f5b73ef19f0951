// =============================================================================
// Error kinds shared across the sync engine
// =============================================================================
//
// Library-level modules (codec, buffer, store, indicators) return the typed
// `SyncError`; worker loops wrap it with `anyhow::Context` at the point where
// the failure is logged and handled.

use thiserror::Error;

/// Why a wire field failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Required field is absent from the payload.
    Missing,
    /// Field is present but has the wrong JSON type.
    WrongType,
    /// Field has the right type but an unparseable value.
    Malformed,
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::WrongType => write!(f, "wrong type"),
            Self::Malformed => write!(f, "malformed"),
        }
    }
}

/// A required wire field was absent or had the wrong shape.
///
/// Optional fields never produce this -- they default to zero at the codec
/// level.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("field `{field}` {kind}")]
pub struct ParseError {
    pub field: &'static str,
    pub kind: FieldKind,
}

impl ParseError {
    pub fn missing(field: &'static str) -> Self {
        Self {
            field,
            kind: FieldKind::Missing,
        }
    }

    pub fn wrong_type(field: &'static str) -> Self {
        Self {
            field,
            kind: FieldKind::WrongType,
        }
    }

    pub fn malformed(field: &'static str) -> Self {
        Self {
            field,
            kind: FieldKind::Malformed,
        }
    }
}

/// Top-level error taxonomy for the market-data core.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Configuration file missing, unreadable, or missing a required key.
    #[error("config error: {0}")]
    Config(String),

    /// A wire payload violated the exchange format.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// TLS / TCP / WebSocket / HTTP failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer sent something structurally valid but protocol-unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Document-store operation failed.
    #[error("store error: {0}")]
    Store(#[from] mongodb::error::Error),

    /// Stream-buffer operation failed.
    #[error("buffer error: {0}")]
    Buffer(#[from] redis::RedisError),

    /// A persisted indicator state did not match the calculator it was
    /// offered to.
    #[error("indicator state error: {0}")]
    State(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_display_names_field_and_kind() {
        let e = ParseError::missing("k.t");
        assert_eq!(e.to_string(), "field `k.t` missing");
        let e = ParseError::wrong_type("s");
        assert_eq!(e.to_string(), "field `s` wrong type");
    }

    #[test]
    fn sync_error_wraps_parse_error() {
        let e: SyncError = ParseError::malformed("k.o").into();
        assert!(e.to_string().contains("k.o"));
        assert!(matches!(e, SyncError::Parse(_)));
    }
}
