//! In-process cache backend.
//!
//! Backs tests and single-instance development deployments. State is scoped
//! to this process: under horizontal scale-out each instance sees its own
//! cache, so production uses [`RedisCache`](super::RedisCache) instead.

use super::types::pattern_matches;
use super::{Cache, CacheEntry, CacheResult, CacheStats};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// A cache held entirely in process memory.
///
/// Single-flight recomputation uses a per-key `tokio::sync::Mutex` instead
/// of the shared-store lock protocol: within one process, mutual exclusion
/// is enough and callers never observe a lock timeout.
#[derive(Debug)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    /// One mutex per key currently being computed.
    compute_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    namespace: Option<String>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    /// Creates an empty cache with no key namespace.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            compute_locks: Mutex::new(HashMap::new()),
            namespace: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Creates an empty cache whose keys are prefixed with `{namespace}:`,
    /// isolating it from other caches sharing the process.
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::new()
        }
    }

    fn full_key(&self, key: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{}:{}", ns, key),
            None => key.to_string(),
        }
    }

    async fn compute_lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.compute_locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops every expired entry. Expiry is otherwise enforced lazily on
    /// read, so long-lived processes should call this periodically.
    pub async fn cleanup_expired(&self) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| !entry.is_expired());
    }

    /// Removes every entry.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Resets the hit/miss counters.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cz_cache_hits_total", "backend" => "memory").increment(1);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cz_cache_misses_total", "backend" => "memory").increment(1);
    }

    fn expiry_for(ttl: Duration) -> Option<chrono::DateTime<Utc>> {
        if ttl.is_zero() {
            None
        } else {
            Some(Utc::now() + ChronoDuration::milliseconds(ttl.as_millis() as i64))
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let full_key = self.full_key(key);
        let entries = self.entries.read().await;

        match entries.get(&full_key) {
            Some(entry) if !entry.is_expired() => {
                self.record_hit();
                Ok(Some(entry.value.clone()))
            }
            // Expired entries count as misses; cleanup_expired reclaims them.
            _ => {
                self.record_miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let full_key = self.full_key(key);
        let entry = CacheEntry::new(value.to_vec(), Self::expiry_for(ttl));
        self.entries.write().await.insert(full_key, entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let full_key = self.full_key(key);
        Ok(self.entries.write().await.remove(&full_key).is_some())
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let full_key = self.full_key(key);
        let entries = self.entries.read().await;
        Ok(entries
            .get(&full_key)
            .map(|entry| !entry.is_expired())
            .unwrap_or(false))
    }

    async fn mget(&self, keys: &[&str]) -> CacheResult<Vec<Option<Vec<u8>>>> {
        let entries = self.entries.read().await;
        let mut results = Vec::with_capacity(keys.len());

        for key in keys {
            match entries.get(&self.full_key(key)) {
                Some(entry) if !entry.is_expired() => {
                    self.record_hit();
                    results.push(Some(entry.value.clone()));
                }
                _ => {
                    self.record_miss();
                    results.push(None);
                }
            }
        }

        Ok(results)
    }

    async fn mset(&self, batch: &[(&str, &[u8], Duration)]) -> CacheResult<()> {
        let mut entries = self.entries.write().await;

        for (key, value, ttl) in batch {
            let entry = CacheEntry::new(value.to_vec(), Self::expiry_for(*ttl));
            entries.insert(self.full_key(key), entry);
        }

        Ok(())
    }

    async fn invalidate_pattern(&self, pattern: &str) -> CacheResult<u64> {
        let full_pattern = self.full_key(pattern);
        let mut entries = self.entries.write().await;

        let before = entries.len();
        entries.retain(|key, _| !pattern_matches(&full_pattern, key));
        let removed = (before - entries.len()) as u64;

        metrics::counter!("cz_cache_invalidated_keys_total", "backend" => "memory")
            .increment(removed);
        Ok(removed)
    }

    async fn get_or_set<F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> CacheResult<Vec<u8>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = CacheResult<Vec<u8>>> + Send,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }

        let lock = self.compute_lock_for(key).await;
        let _guard = lock.lock().await;

        // Another caller may have finished while we waited for the lock.
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }

        let value = compute().await?;
        self.set(key, &value, ttl).await?;
        Ok(value)
    }

    fn stats(&self) -> CacheStats {
        let size = match self.entries.try_read() {
            Ok(entries) => entries.len() as u64,
            Err(_) => 0,
        };

        CacheStats::new(
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            size,
        )
    }
}
