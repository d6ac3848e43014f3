//! Cache error types

use std::time::Duration;

use redis::RedisError;

/// Errors raised by an [`OverflowStore`](crate::OverflowStore) implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Overflow store I/O error: {0}")]
    Io(String),

    #[error("Stored entry is corrupt: {0}")]
    Corrupt(String),
}

/// Cache-related errors
///
/// A missing key and a rejected stale write are ordinary outcomes and are
/// reported through return values, never through this type.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Owning node unavailable within {timeout:?}")]
    RemoteUnavailable { timeout: Duration },

    #[error("Store failure: {0}")]
    StoreFailure(#[from] StoreError),

    #[error("Invalid predicate: {0}")]
    InvalidPredicate(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported schema version {found} (this node understands up to {supported})")]
    UnsupportedSchema { found: u16, supported: u16 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Backend error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl CacheError {
    /// Whether the error means the owning node could not be reached in time.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CacheError::RemoteUnavailable { .. })
    }
}
