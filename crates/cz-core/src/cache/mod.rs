//! Shared read-through cache for inventory and recipe lookups.
//!
//! Every read path of the backend consults this layer before touching the
//! document store. The cache is an optimization only: infrastructure
//! failures degrade to misses (reads) or best-effort no-ops (writes) via the
//! soft accessors, and must never fail a request.
//!
//! # Example
//!
//! ```ignore
//! use cz_core::cache::{Cache, MemoryCache};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cz_core::cache::CacheError> {
//!     let cache = MemoryCache::new();
//!
//!     cache.set("product:42", b"{\"name\":\"saffron\"}", Duration::from_secs(300)).await?;
//!     let hit = cache.get("product:42").await?;
//!
//!     // Single-flight recomputation: with concurrent cold-cache readers,
//!     // only one executes the closure; the rest share its result.
//!     let menu = cache.get_or_set("menu:today", Duration::from_secs(60), || async {
//!         Ok(b"rendered menu".to_vec())
//!     }).await?;
//!
//!     // Writes to a product invalidate every derived view of it.
//!     cache.invalidate_pattern("product:42*").await?;
//!     Ok(())
//! }
//! ```

mod error;
mod memory;
mod redis;
mod types;

pub use error::{CacheError, CacheResult};
pub use memory::MemoryCache;
pub use self::redis::{RedisCache, RedisCacheConfig};
pub use types::{pattern_matches, CacheEntry, CacheStats};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

/// A TTL-aware key-value cache with batch access, pattern invalidation, and
/// single-flight recomputation.
///
/// Implementations must be `Send + Sync + 'static`. A TTL of
/// `Duration::ZERO` means the entry never expires.
///
/// Two access styles are provided:
///
/// - the strict methods (`get`, `set`, ...) surface backend failures as
///   [`CacheError`] for callers that need to know;
/// - the `*_soft` methods encode the degradation policy of this layer:
///   a failed read is a miss, a failed write is reported but swallowed.
///   Request handlers should use these.
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    /// Reads a value. `Ok(None)` if the key is absent or expired.
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Writes a value with the given TTL, overwriting any previous entry.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()>;

    /// Removes a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Returns whether a live (non-expired) entry exists for the key.
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Reads several keys at once, preserving order; missing or expired
    /// keys yield `None` at their position.
    async fn mget(&self, keys: &[&str]) -> CacheResult<Vec<Option<Vec<u8>>>>;

    /// Writes several `(key, value, ttl)` entries in one round trip.
    async fn mset(&self, entries: &[(&str, &[u8], Duration)]) -> CacheResult<()>;

    /// Deletes every key matching a glob pattern and returns how many were
    /// removed.
    ///
    /// Cost is proportional to the number of keys in the store, and the
    /// enumeration is not atomic with respect to concurrent writes. Intended
    /// for write-path invalidation ("product changed, drop every view of
    /// it"), not for hot read paths or unbounded key spaces.
    async fn invalidate_pattern(&self, pattern: &str) -> CacheResult<u64>;

    /// Returns the cached value, or computes, stores, and returns it.
    ///
    /// Concurrent callers for the same missing key are collapsed: one runs
    /// `compute`, the others wait and re-read. Waiting is bounded; once the
    /// retry budget is exhausted, [`CacheError::LockTimeout`] is returned
    /// and the caller may compute without caching. If `compute` itself
    /// fails, nothing is stored and the error propagates.
    async fn get_or_set<F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> CacheResult<Vec<u8>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = CacheResult<Vec<u8>>> + Send;

    /// Current hit/miss counters. Size is approximate for shared backends.
    fn stats(&self) -> CacheStats;

    /// Reads a value, treating any backend failure as a miss.
    async fn get_soft(&self, key: &str) -> Option<Vec<u8>> {
        match self.get(key).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(key, error = %err, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// Writes a value best-effort. Returns whether the write succeeded.
    async fn set_soft(&self, key: &str, value: &[u8], ttl: Duration) -> bool {
        match self.set(key, value, ttl).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(key, error = %err, "cache write failed, continuing without it");
                false
            }
        }
    }

    /// Deletes a key best-effort. Returns whether the delete succeeded
    /// (including "key was already absent").
    async fn delete_soft(&self, key: &str) -> bool {
        match self.delete(key).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(key, error = %err, "cache delete failed");
                false
            }
        }
    }

    /// Reads and deserializes a JSON value.
    async fn get_json<T>(&self, key: &str) -> CacheResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| CacheError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Serializes a value as JSON and writes it.
    async fn set_json<T>(&self, key: &str, value: &T, ttl: Duration) -> CacheResult<()>
    where
        T: Serialize + Sync,
    {
        let bytes =
            serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.set(key, &bytes, ttl).await
    }
}
