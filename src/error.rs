//! Error types for cache operations.

use thiserror::Error;

/// Result type alias using the crate error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the cache layer.
///
/// A missing entity is not an error: loaders return `Ok(None)` for it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Key-value store unreachable, pool exhausted, or command failed.
    #[error("Cache store unavailable: {0}")]
    StoreUnavailable(String),

    /// Mutex rebuild gave up after exhausting its retry budget.
    #[error("Lock contention on {key}: gave up after {attempts} attempts")]
    LockContention { key: String, attempts: u32 },

    /// Background rebuild failed. Only logged, never returned to readers.
    #[error("Rebuild failed for {key}: {reason}")]
    RebuildFailure { key: String, reason: String },

    /// Rebuild queue is full.
    #[error("Rebuild executor saturated (queue capacity {capacity})")]
    ExecutorSaturated { capacity: usize },

    /// Backing repository (database) failure.
    #[error("Repository error: {0}")]
    RepositoryError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// Bytes in the store are not a cache envelope.
    #[error("Invalid cache entry: {0}")]
    InvalidCacheEntry(String),

    /// Envelope written by an incompatible schema version.
    #[error("Cache schema version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl Error {
    /// Whether the caller may reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_) | Error::LockContention { .. }
        )
    }

    /// Whether the error came from decoding a stored value.
    ///
    /// The loader treats these as a cache miss.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Error::DeserializationError(_)
                | Error::InvalidCacheEntry(_)
                | Error::VersionMismatch { .. }
        )
    }
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Error::DeserializationError(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::DeserializationError(e.to_string())
    }
}
