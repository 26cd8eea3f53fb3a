//! Cache error types.

use thiserror::Error;

/// Errors that can occur during cache operations.
///
/// Infrastructure failures (`Connection`, `Unknown`) are recovered by the
/// soft accessors on the [`Cache`](super::Cache) trait; they only reach
/// callers that use the strict API directly.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Failed to connect to the cache backend.
    #[error("cache connection failed: {0}")]
    Connection(String),

    /// Failed to serialize or deserialize a cached value.
    #[error("cache serialization error: {0}")]
    Serialization(String),

    /// Gave up waiting for another caller's in-flight computation.
    ///
    /// Raised by `get_or_set` once the lock retry budget is exhausted.
    /// Callers may compute the value locally without caching it.
    #[error("timed out waiting for computation lock on key: {0}")]
    LockTimeout(String),

    /// An error reported by the backend that fits no other category.
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
