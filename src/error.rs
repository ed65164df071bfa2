//! Error types for the portal cache
//!
//! Provides structured error types for the shared store adapter, the
//! serialization boundary and caller-supplied value factories.
//!
//! Most public cache operations never surface these: a failing shared store
//! degrades to "absent / allow / no lock" plus a logged warning. Errors reach
//! callers only for explicit writes that could not be serialized and for
//! factories that failed with nothing cached to fall back on.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the cache subsystem
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Shared Store Errors
    // =========================================================================
    #[error("Shared store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("Shared store pool error: {0}")]
    StorePool(String),

    #[error("Shared store operation {operation} timed out after {timeout:?}")]
    StoreTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Shared store unavailable: {backend}")]
    StoreUnavailable { backend: String },

    #[error("Invalidation subscription failed: {0}")]
    Subscription(String),

    #[error("Unexpected value type at key {key}")]
    WrongType { key: String },

    // =========================================================================
    // Serialization Errors
    // =========================================================================
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    // =========================================================================
    // Caller Errors
    // =========================================================================
    #[error("Value factory failed: {0}")]
    Factory(#[source] anyhow::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<deadpool_redis::PoolError> for Error {
    fn from(e: deadpool_redis::PoolError) -> Self {
        Error::StorePool(e.to_string())
    }
}

impl Error {
    /// Check if this error came from talking to the shared store
    ///
    /// Transient errors are logged and the operation fails open.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Store(_)
                | Error::StorePool(_)
                | Error::StoreTimeout { .. }
                | Error::StoreUnavailable { .. }
                | Error::Subscription(_)
        )
    }

    /// Check if this error is a payload that could not round-trip the wire format
    pub fn is_serialization(&self) -> bool {
        matches!(self, Error::Serialization(_))
    }
}

/// Result type alias for the cache subsystem
pub type Result<T> = std::result::Result<T, Error>;
