//! Error types for session-core operations.
//!
//! Nothing in this crate lets these escape to the request pipeline: the
//! monitor turns connection errors into `false`, the resolver turns lookup
//! errors into a fail-open outcome. They exist so the cause can be logged.

use std::path::PathBuf;

/// All errors that can occur while talking to the session store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    // ─────────────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Unsupported store URI: {0}")]
    InvalidUri(String),

    #[error("Store connection failed: {uri}: {source}")]
    Connection {
        uri: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Store is not connected")]
    NotConnected,

    #[error("Store ping failed: {0}")]
    Ping(String),

    /// The driver panicked inside `operation`; the panic was contained.
    #[error("Store driver panicked during {operation}")]
    DriverPanic { operation: &'static str },

    // ─────────────────────────────────────────────────────────────────────
    // Lookup Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Store query failed: {context}: {source}")]
    Lookup {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Malformed session record for {identity_key}: {details}")]
    MalformedRecord {
        identity_key: String,
        details: String,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Shutdown Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Store shutdown failed: {source}")]
    Shutdown {
        #[source]
        source: rusqlite::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Configuration / I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration malformed: {path}: {details}")]
    Config { path: PathBuf, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// Short machine-readable category, used as a structured log field.
    pub fn category(&self) -> &'static str {
        match self {
            StoreError::InvalidUri(_)
            | StoreError::Connection { .. }
            | StoreError::NotConnected
            | StoreError::Ping(_) => "connection",
            StoreError::Lookup { .. } | StoreError::MalformedRecord { .. } => "lookup",
            StoreError::Shutdown { .. } => "shutdown",
            StoreError::DriverPanic { operation } => match *operation {
                "disconnect" => "shutdown",
                "stats" | "list_collections" => "lookup",
                _ => "connection",
            },
            StoreError::Config { .. } | StoreError::Io { .. } => "config",
        }
    }
}

/// Convenience type alias for Results using StoreError.
pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for String {
    fn from(err: StoreError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(StoreError::NotConnected.category(), "connection");
        assert_eq!(
            StoreError::InvalidUri("redis://x".to_string()).category(),
            "connection"
        );
        assert_eq!(
            StoreError::MalformedRecord {
                identity_key: "alice".to_string(),
                details: "bad timestamp".to_string(),
            }
            .category(),
            "lookup"
        );
        assert_eq!(
            StoreError::Shutdown {
                source: rusqlite::Error::InvalidQuery,
            }
            .category(),
            "shutdown"
        );
    }

    #[test]
    fn driver_panic_category_follows_operation() {
        let driver_panic = |operation| StoreError::DriverPanic { operation };
        assert_eq!(driver_panic("connect").category(), "connection");
        assert_eq!(driver_panic("ping").category(), "connection");
        assert_eq!(driver_panic("disconnect").category(), "shutdown");
        assert_eq!(driver_panic("stats").category(), "lookup");
        assert_eq!(
            driver_panic("disconnect").to_string(),
            "Store driver panicked during disconnect"
        );
    }

    #[test]
    fn converts_to_string_with_context() {
        let message: String = StoreError::InvalidUri("redis://x".to_string()).into();
        assert_eq!(message, "Unsupported store URI: redis://x");
    }
}
