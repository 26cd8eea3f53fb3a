//! Redis cache backend.
//!
//! The production cache shared by every backend instance. Besides the plain
//! key-value operations it implements the stampede guard: cold-cache
//! recomputation is serialized across instances with a `SET NX EX` lock per
//! key, so one instance computes while the rest wait and re-read.
//!
//! Waiters use bounded exponential backoff with jitter rather than an
//! unbounded poll loop; once the wait budget is exhausted they receive
//! [`CacheError::LockTimeout`] and may compute locally without caching.
//! The lock TTL is the crash backstop: if a holder dies mid-compute, the
//! lock expires and the next waiter takes over. A compute that outlives the
//! lock TTL can therefore run twice; size `lock_ttl` above the worst-case
//! compute latency when that matters.

use super::{Cache, CacheError, CacheResult, CacheStats};
use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use rand::Rng;
use redis::AsyncCommands;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Releases a lock only if the caller still holds it, so a lock that
/// expired and was re-acquired by another instance is never deleted.
const RELEASE_LOCK_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    else
        return 0
    end
"#;

/// Configuration for [`RedisCache`].
#[derive(Debug, Clone)]
pub struct RedisCacheConfig {
    /// Redis connection URL, e.g. `redis://cache.internal:6379`.
    pub url: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// Prefix prepended to every key, e.g. `cz:cache`.
    pub key_prefix: String,
    /// Namespace between prefix and key, for isolating deployments.
    pub namespace: String,
    /// TTL applied by [`RedisCache::set_default`] when the caller has no
    /// better one.
    pub default_ttl: Duration,
    /// TTL of the per-key recomputation lock.
    pub lock_ttl: Duration,
    /// First backoff delay while waiting on another caller's computation.
    pub lock_retry_initial: Duration,
    /// Upper bound on a single backoff delay.
    pub lock_retry_max: Duration,
    /// Total time budget for waiting on a lock before `LockTimeout`.
    pub lock_wait_budget: Duration,
    /// Batch size for SCAN during pattern invalidation.
    pub scan_batch: usize,
}

impl RedisCacheConfig {
    /// Creates a configuration with production defaults for the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 16,
            key_prefix: "cz:cache".to_string(),
            namespace: "default".to_string(),
            default_ttl: Duration::from_secs(300),
            lock_ttl: Duration::from_secs(10),
            lock_retry_initial: Duration::from_millis(50),
            lock_retry_max: Duration::from_secs(1),
            lock_wait_budget: Duration::from_secs(10),
            scan_batch: 100,
        }
    }

    /// Sets the maximum number of pooled connections.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Sets the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the default entry TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Sets the recomputation lock TTL.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Sets the lock wait budget.
    pub fn with_lock_wait_budget(mut self, budget: Duration) -> Self {
        self.lock_wait_budget = budget;
        self
    }

    /// Sets the initial and maximum backoff delays.
    pub fn with_lock_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.lock_retry_initial = initial;
        self.lock_retry_max = max;
        self
    }
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self::new("redis://localhost:6379")
    }
}

/// The shared Redis-backed cache.
///
/// Keys are stored as `{key_prefix}:{namespace}:{key}`; recomputation locks
/// as `{key_prefix}:lock:{namespace}:{key}`. The instance id is the lock
/// holder token, checked on release.
pub struct RedisCache {
    pool: Pool,
    config: RedisCacheConfig,
    instance_id: String,
    hits: AtomicU64,
    misses: AtomicU64,
    /// Last known entry count, refreshed by [`refresh_size`](Self::refresh_size).
    last_size: AtomicU64,
}

impl RedisCache {
    /// Connects to Redis and verifies the connection with a PING.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Connection`] if the pool cannot be built or the
    /// server is unreachable.
    pub async fn new(config: RedisCacheConfig) -> CacheResult<Self> {
        let pool = PoolConfig::from_url(&config.url)
            .builder()
            .map_err(|e| CacheError::Connection(format!("failed to create pool config: {e}")))?
            .max_size(config.max_connections as usize)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| CacheError::Connection(format!("failed to build pool: {e}")))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(format!("failed to get connection: {e}")))?;

        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| CacheError::Connection(format!("redis PING failed: {e}")))?;

        Ok(Self {
            pool,
            config,
            instance_id: Uuid::new_v4().to_string(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            last_size: AtomicU64::new(0),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!(
            "{}:{}:{}",
            self.config.key_prefix, self.config.namespace, key
        )
    }

    fn lock_key(&self, key: &str) -> String {
        format!(
            "{}:lock:{}:{}",
            self.config.key_prefix, self.config.namespace, key
        )
    }

    async fn conn(&self) -> CacheResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(format!("failed to get connection: {e}")))
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cz_cache_hits_total", "backend" => "redis").increment(1);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cz_cache_misses_total", "backend" => "redis").increment(1);
    }

    /// Tries to take the recomputation lock for `key`.
    async fn try_acquire_lock(&self, key: &str) -> CacheResult<bool> {
        let lock_key = self.lock_key(key);
        let ttl_secs = self.config.lock_ttl.as_secs().max(1);
        let mut conn = self.conn().await?;

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&lock_key)
            .arg(&self.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut *conn)
            .await
            .map_err(|e| CacheError::Backend(format!("lock acquisition failed: {e}")))?;

        Ok(acquired.is_some())
    }

    /// Releases the lock for `key` if this instance still holds it.
    async fn release_lock(&self, key: &str) -> CacheResult<()> {
        let lock_key = self.lock_key(key);
        let mut conn = self.conn().await?;

        redis::Script::new(RELEASE_LOCK_SCRIPT)
            .key(&lock_key)
            .arg(&self.instance_id)
            .invoke_async::<i32>(&mut *conn)
            .await
            .map_err(|e| CacheError::Backend(format!("lock release failed: {e}")))?;

        Ok(())
    }

    /// Adds up to 50% random jitter so synchronized waiters fan out.
    fn jittered(delay: Duration) -> Duration {
        let half = (delay.as_millis() as u64) / 2;
        let jitter = if half == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=half)
        };
        delay + Duration::from_millis(jitter)
    }

    /// Counts entries under this cache's prefix and caches the result for
    /// [`stats`](Cache::stats). SCAN-based, so cost grows with keyspace size.
    pub async fn refresh_size(&self) -> CacheResult<u64> {
        let pattern = format!("{}:{}:*", self.config.key_prefix, self.config.namespace);
        let mut conn = self.conn().await?;
        let mut cursor: u64 = 0;
        let mut count: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(self.config.scan_batch)
                .query_async(&mut *conn)
                .await
                .map_err(|e| CacheError::Backend(format!("SCAN failed: {e}")))?;

            count += keys.len() as u64;
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        self.last_size.store(count, Ordering::Relaxed);
        Ok(count)
    }

    /// Writes a value under the configured default TTL.
    pub async fn set_default(&self, key: &str, value: &[u8]) -> CacheResult<()> {
        self.set(key, value, self.config.default_ttl).await
    }

    /// Resets the hit/miss counters.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("key_prefix", &self.config.key_prefix)
            .field("namespace", &self.config.namespace)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let full_key = self.full_key(key);
        let mut conn = self.conn().await?;

        let value: Option<Vec<u8>> = conn
            .get(&full_key)
            .await
            .map_err(|e| CacheError::Backend(format!("GET failed: {e}")))?;

        match value {
            Some(value) => {
                self.record_hit();
                Ok(Some(value))
            }
            None => {
                self.record_miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let full_key = self.full_key(key);
        let mut conn = self.conn().await?;

        if ttl.is_zero() {
            let _: () = conn
                .set(&full_key, value)
                .await
                .map_err(|e| CacheError::Backend(format!("SET failed: {e}")))?;
        } else {
            let _: () = conn
                .set_ex(&full_key, value, ttl.as_secs().max(1))
                .await
                .map_err(|e| CacheError::Backend(format!("SETEX failed: {e}")))?;
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let full_key = self.full_key(key);
        let mut conn = self.conn().await?;

        let deleted: i64 = conn
            .del(&full_key)
            .await
            .map_err(|e| CacheError::Backend(format!("DEL failed: {e}")))?;

        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let full_key = self.full_key(key);
        let mut conn = self.conn().await?;

        conn.exists(&full_key)
            .await
            .map_err(|e| CacheError::Backend(format!("EXISTS failed: {e}")))
    }

    async fn mget(&self, keys: &[&str]) -> CacheResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(vec![]);
        }

        let full_keys: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        let mut conn = self.conn().await?;

        let results: Vec<Option<Vec<u8>>> = conn
            .mget(&full_keys)
            .await
            .map_err(|e| CacheError::Backend(format!("MGET failed: {e}")))?;

        for result in &results {
            if result.is_some() {
                self.record_hit();
            } else {
                self.record_miss();
            }
        }

        Ok(results)
    }

    async fn mset(&self, entries: &[(&str, &[u8], Duration)]) -> CacheResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();

        for (key, value, ttl) in entries {
            let full_key = self.full_key(key);
            if ttl.is_zero() {
                pipe.set(&full_key, *value);
            } else {
                pipe.set_ex(&full_key, *value, ttl.as_secs().max(1));
            }
        }

        pipe.query_async::<()>(&mut *conn)
            .await
            .map_err(|e| CacheError::Backend(format!("MSET pipeline failed: {e}")))?;

        Ok(())
    }

    async fn invalidate_pattern(&self, pattern: &str) -> CacheResult<u64> {
        let full_pattern = self.full_key(pattern);
        let mut conn = self.conn().await?;
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&full_pattern)
                .arg("COUNT")
                .arg(self.config.scan_batch)
                .query_async(&mut *conn)
                .await
                .map_err(|e| CacheError::Backend(format!("SCAN failed: {e}")))?;

            if !keys.is_empty() {
                let deleted: i64 = conn
                    .del(&keys)
                    .await
                    .map_err(|e| CacheError::Backend(format!("DEL failed: {e}")))?;
                removed += deleted as u64;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        tracing::debug!(pattern, removed, "invalidated cache keys");
        metrics::counter!("cz_cache_invalidated_keys_total", "backend" => "redis")
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

        // Wait for the lock under a fixed budget, backing off exponentially
        // with jitter and re-reading the cache between attempts.
        let mut waited = Duration::ZERO;
        let mut delay = self.config.lock_retry_initial;
        let mut acquired = self.try_acquire_lock(key).await?;

        while !acquired && waited < self.config.lock_wait_budget {
            metrics::counter!("cz_cache_lock_contention_total").increment(1);

            let sleep_for = Self::jittered(delay);
            tokio::time::sleep(sleep_for).await;
            waited += sleep_for;
            delay = (delay * 2).min(self.config.lock_retry_max);

            // The holder may have finished while we slept.
            if let Some(value) = self.get(key).await? {
                return Ok(value);
            }

            acquired = self.try_acquire_lock(key).await?;
        }

        if !acquired {
            metrics::counter!("cz_cache_lock_timeouts_total").increment(1);
            return Err(CacheError::LockTimeout(format!(
                "key '{}' still locked after {:?}",
                key, self.config.lock_wait_budget
            )));
        }

        // Double-check under the lock: another instance may have populated
        // the entry between our miss and our acquisition.
        if let Some(value) = self.get(key).await? {
            let _ = self.release_lock(key).await;
            return Ok(value);
        }

        let result = compute().await;
        let release_result = self.release_lock(key).await;

        match result {
            Ok(value) => {
                self.set(key, &value, ttl).await?;
                if let Err(err) = release_result {
                    tracing::warn!(key, error = %err, "failed to release recomputation lock");
                }
                Ok(value)
            }
            Err(err) => {
                // Never cache a failure; the lock TTL covers a failed release.
                if let Err(lock_err) = release_result {
                    tracing::warn!(key, error = %lock_err, "failed to release recomputation lock");
                }
                Err(err)
            }
        }
    }

    fn stats(&self) -> CacheStats {
        CacheStats::new(
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.last_size.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests that need a live Redis are #[ignore]d; run them against a local
    // instance with: cargo test -p cz-core cache::redis -- --ignored

    fn test_config() -> RedisCacheConfig {
        RedisCacheConfig::new("redis://localhost:6379")
            .with_key_prefix("cz:test:cache")
            .with_namespace("test")
    }

    #[test]
    fn test_config_builder() {
        let config = RedisCacheConfig::new("redis://cache.internal:6380")
            .with_max_connections(32)
            .with_key_prefix("custom")
            .with_namespace("staging")
            .with_default_ttl(Duration::from_secs(600))
            .with_lock_ttl(Duration::from_secs(30))
            .with_lock_wait_budget(Duration::from_secs(5))
            .with_lock_backoff(Duration::from_millis(25), Duration::from_millis(500));

        assert_eq!(config.url, "redis://cache.internal:6380");
        assert_eq!(config.max_connections, 32);
        assert_eq!(config.key_prefix, "custom");
        assert_eq!(config.namespace, "staging");
        assert_eq!(config.default_ttl, Duration::from_secs(600));
        assert_eq!(config.lock_ttl, Duration::from_secs(30));
        assert_eq!(config.lock_wait_budget, Duration::from_secs(5));
        assert_eq!(config.lock_retry_initial, Duration::from_millis(25));
        assert_eq!(config.lock_retry_max, Duration::from_millis(500));
    }

    #[test]
    fn test_key_layout() {
        let config = test_config();
        let full = format!("{}:{}:{}", config.key_prefix, config.namespace, "product:7");
        assert_eq!(full, "cz:test:cache:test:product:7");

        let lock = format!("{}:lock:{}:{}", config.key_prefix, config.namespace, "product:7");
        assert_eq!(lock, "cz:test:cache:lock:test:product:7");
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let delayed = RedisCache::jittered(Duration::from_millis(100));
            assert!(delayed >= Duration::from_millis(100));
            assert!(delayed <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_round_trip() {
        let cache = RedisCache::new(test_config()).await.unwrap();
        let _ = cache.delete("rt").await;

        cache.set("rt", b"value", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("rt").await.unwrap(), Some(b"value".to_vec()));

        assert!(cache.delete("rt").await.unwrap());
        assert_eq!(cache.get("rt").await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_ttl_expiry() {
        let cache = RedisCache::new(test_config()).await.unwrap();

        cache.set("ttl", b"v", Duration::from_secs(1)).await.unwrap();
        assert!(cache.exists("ttl").await.unwrap());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(cache.get("ttl").await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_mget_mset() {
        let cache = RedisCache::new(test_config()).await.unwrap();

        let entries: Vec<(&str, &[u8], Duration)> = vec![
            ("m1", b"1", Duration::from_secs(60)),
            ("m2", b"2", Duration::from_secs(60)),
        ];
        cache.mset(&entries).await.unwrap();

        let results = cache.mget(&["m1", "m2", "m3"]).await.unwrap();
        assert_eq!(results[0], Some(b"1".to_vec()));
        assert_eq!(results[1], Some(b"2".to_vec()));
        assert_eq!(results[2], None);

        cache.delete("m1").await.unwrap();
        cache.delete("m2").await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_invalidate_pattern() {
        let cache = RedisCache::new(test_config()).await.unwrap();

        cache.set("products:a", b"1", Duration::from_secs(60)).await.unwrap();
        cache.set("products:b", b"2", Duration::from_secs(60)).await.unwrap();
        cache.set("recipes:x", b"3", Duration::from_secs(60)).await.unwrap();

        let removed = cache.invalidate_pattern("products:*").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.get("recipes:x").await.unwrap(), Some(b"3".to_vec()));

        cache.delete("recipes:x").await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_single_flight() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        let cache = Arc::new(RedisCache::new(test_config()).await.unwrap());
        let _ = cache.delete("flight").await;

        let computations = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..5 {
            let cache = Arc::clone(&cache);
            let computations = Arc::clone(&computations);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_set("flight", Duration::from_secs(60), || {
                        let computations = Arc::clone(&computations);
                        async move {
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            computations.fetch_add(1, Ordering::SeqCst);
                            Ok(b"computed".to_vec())
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), b"computed".to_vec());
        }
        assert_eq!(computations.load(Ordering::SeqCst), 1);

        cache.delete("flight").await.unwrap();
    }
}
