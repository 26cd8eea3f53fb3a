//! Redis-backed rate limiter.
//!
//! Enforces one operation class's policy across every backend instance.
//! Counters live in the shared store as `{prefix}:{class}:{identifier}`
//! with the window length as their TTL; penalty blocks as
//! `{prefix}:block:{class}:{identifier}` with the block length as theirs.
//!
//! Admission is INCRBY-then-check: the increment is atomic, and a request
//! that pushes the counter over budget is refunded and denied. Two
//! instances racing on the same identifier can momentarily overshoot by one
//! request's points before the refund lands; the count is a cost-control
//! approximation, not an exact meter.
//!
//! Store failures never deny traffic here; they surface as
//! [`RateLimitError::StoreUnavailable`] so the facade can degrade to the
//! in-process limiter.

use super::error::RateLimitError;
use super::policy::{LimitStatus, OperationClass, RateLimitPolicy};
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::time::Duration;

/// Distributed limiter for one operation class.
#[derive(Clone)]
pub struct RedisRateLimiter {
    pool: Pool,
    key_prefix: String,
    class: OperationClass,
    policy: RateLimitPolicy,
}

impl RedisRateLimiter {
    /// Creates a limiter over an existing connection pool.
    pub fn new(
        pool: Pool,
        key_prefix: impl Into<String>,
        class: OperationClass,
        policy: RateLimitPolicy,
    ) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.into(),
            class,
            policy,
        }
    }

    fn counter_key(&self, identifier: &str) -> String {
        format!("{}:{}:{}", self.key_prefix, self.class.key_segment(), identifier)
    }

    fn block_key(&self, identifier: &str) -> String {
        format!(
            "{}:block:{}:{}",
            self.key_prefix,
            self.class.key_segment(),
            identifier
        )
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, RateLimitError> {
        self.pool
            .get()
            .await
            .map_err(|e| RateLimitError::StoreUnavailable(format!("connection failed: {e}")))
    }

    fn store_err(context: &str, err: redis::RedisError) -> RateLimitError {
        RateLimitError::StoreUnavailable(format!("{context}: {err}"))
    }

    /// Consumes one point for the identifier.
    pub async fn check(&self, identifier: &str) -> Result<(), RateLimitError> {
        self.check_n(identifier, 1, None).await
    }

    /// Consumes `points`, optionally against an overridden budget.
    pub async fn check_n(
        &self,
        identifier: &str,
        points: u32,
        budget_override: Option<u32>,
    ) -> Result<(), RateLimitError> {
        let mut conn = self.conn().await?;

        // A standing penalty denies before the counter is touched.
        let block_key = self.block_key(identifier);
        let block_ttl_ms: i64 = redis::cmd("PTTL")
            .arg(&block_key)
            .query_async(&mut *conn)
            .await
            .map_err(|e| Self::store_err("PTTL block failed", e))?;
        if block_ttl_ms > 0 {
            return Err(RateLimitError::LimitExceeded {
                retry_after: Duration::from_millis(block_ttl_ms as u64),
            });
        }

        let counter_key = self.counter_key(identifier);
        let count: i64 = conn
            .incr(&counter_key, points as i64)
            .await
            .map_err(|e| Self::store_err("INCRBY failed", e))?;

        if count == points as i64 {
            // First consumption of a fresh window: start its clock.
            let _: () = conn
                .expire(&counter_key, self.policy.window.as_secs().max(1) as i64)
                .await
                .map_err(|e| Self::store_err("EXPIRE failed", e))?;
        }

        let budget = budget_override.unwrap_or(self.policy.max_points);
        if count <= budget as i64 {
            return Ok(());
        }

        // Over budget: refund the consumption so a smaller request can
        // still fit, then compute how long the caller must wait.
        let _: i64 = conn
            .decr(&counter_key, points as i64)
            .await
            .map_err(|e| Self::store_err("DECRBY failed", e))?;

        let window_ttl_ms: i64 = redis::cmd("PTTL")
            .arg(&counter_key)
            .query_async(&mut *conn)
            .await
            .map_err(|e| Self::store_err("PTTL counter failed", e))?;

        let mut retry_after = if window_ttl_ms > 0 {
            Duration::from_millis(window_ttl_ms as u64)
        } else {
            // Counter exists without a TTL (a lost EXPIRE); restore it so
            // the window cannot live forever.
            let _: () = conn
                .expire(&counter_key, self.policy.window.as_secs().max(1) as i64)
                .await
                .map_err(|e| Self::store_err("EXPIRE failed", e))?;
            self.policy.window
        };

        if let Some(block) = self.policy.block {
            // NX: the first denial starts the penalty; repeats don't extend it.
            let _: Option<String> = redis::cmd("SET")
                .arg(&block_key)
                .arg(1)
                .arg("NX")
                .arg("EX")
                .arg(block.as_secs().max(1))
                .query_async(&mut *conn)
                .await
                .map_err(|e| Self::store_err("SET block failed", e))?;
            retry_after = retry_after.max(block);

            tracing::warn!(
                class = %self.class,
                identifier,
                block_secs = block.as_secs(),
                "budget exhausted, penalty block applied"
            );
        }

        Err(RateLimitError::LimitExceeded { retry_after })
    }

    /// Returns the identifier's standing without consuming.
    pub async fn status(&self, identifier: &str) -> Result<LimitStatus, RateLimitError> {
        let mut conn = self.conn().await?;

        let count: Option<i64> = conn
            .get(self.counter_key(identifier))
            .await
            .map_err(|e| Self::store_err("GET counter failed", e))?;
        let count = count.unwrap_or(0).max(0) as u32;

        let window_ttl_ms: i64 = redis::cmd("PTTL")
            .arg(self.counter_key(identifier))
            .query_async(&mut *conn)
            .await
            .map_err(|e| Self::store_err("PTTL counter failed", e))?;

        let block_ttl_ms: i64 = redis::cmd("PTTL")
            .arg(self.block_key(identifier))
            .query_async(&mut *conn)
            .await
            .map_err(|e| Self::store_err("PTTL block failed", e))?;

        Ok(LimitStatus {
            class: self.class,
            limit: self.policy.max_points,
            remaining: self.policy.max_points.saturating_sub(count),
            reset_after: if window_ttl_ms > 0 {
                Duration::from_millis(window_ttl_ms as u64)
            } else {
                Duration::ZERO
            },
            blocked_for: (block_ttl_ms > 0).then(|| Duration::from_millis(block_ttl_ms as u64)),
        })
    }

    /// Clears the identifier's counter and any penalty.
    pub async fn reset(&self, identifier: &str) -> Result<(), RateLimitError> {
        let mut conn = self.conn().await?;
        let _: i64 = conn
            .del(vec![self.counter_key(identifier), self.block_key(identifier)])
            .await
            .map_err(|e| Self::store_err("DEL failed", e))?;
        Ok(())
    }

    /// The policy this limiter enforces.
    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }
}

impl std::fmt::Debug for RedisRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRateLimiter")
            .field("class", &self.class)
            .field("key_prefix", &self.key_prefix)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deadpool_redis::{Config as PoolConfig, Runtime};

    // Live-Redis tests; run with: cargo test -p cz-core limiter::redis -- --ignored

    fn test_pool() -> Pool {
        PoolConfig::from_url("redis://localhost:6379")
            .builder()
            .unwrap()
            .max_size(4)
            .runtime(Runtime::Tokio1)
            .build()
            .unwrap()
    }

    fn test_limiter(points: u32, window: Duration, block: Option<Duration>) -> RedisRateLimiter {
        let mut policy = RateLimitPolicy::new(points, window);
        policy.block = block;
        RedisRateLimiter::new(test_pool(), "cz:test:rl", OperationClass::Api, policy)
    }

    #[test]
    fn test_key_layout() {
        let limiter = test_limiter(5, Duration::from_secs(60), None);
        assert_eq!(limiter.counter_key("user:u1"), "cz:test:rl:api:user:u1");
        assert_eq!(limiter.block_key("user:u1"), "cz:test:rl:block:api:user:u1");
    }

    #[tokio::test]
    #[ignore]
    async fn test_admits_budget_then_denies() {
        let limiter = test_limiter(3, Duration::from_secs(60), None);
        limiter.reset("u-admit").await.unwrap();

        for _ in 0..3 {
            assert!(limiter.check("u-admit").await.is_ok());
        }

        let denied = limiter.check("u-admit").await.unwrap_err();
        assert!(matches!(denied, RateLimitError::LimitExceeded { .. }));

        limiter.reset("u-admit").await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_refund_leaves_room_for_smaller_request() {
        let limiter = test_limiter(10, Duration::from_secs(60), None);
        limiter.reset("u-refund").await.unwrap();

        assert!(limiter.check_n("u-refund", 8, None).await.is_ok());
        assert!(limiter.check_n("u-refund", 5, None).await.is_err());
        // The denied 5 points were refunded; 2 more still fit.
        assert!(limiter.check_n("u-refund", 2, None).await.is_ok());

        limiter.reset("u-refund").await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_block_persists_past_window() {
        let limiter = test_limiter(
            1,
            Duration::from_secs(1),
            Some(Duration::from_secs(30)),
        );
        limiter.reset("u-block").await.unwrap();

        assert!(limiter.check("u-block").await.is_ok());
        assert!(limiter.check("u-block").await.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let denied = limiter.check("u-block").await.unwrap_err();
        assert!(denied.retry_after_secs().unwrap() > 20);

        limiter.reset("u-block").await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_status_does_not_consume() {
        let limiter = test_limiter(5, Duration::from_secs(60), None);
        limiter.reset("u-status").await.unwrap();

        limiter.check("u-status").await.unwrap();

        let first = limiter.status("u-status").await.unwrap();
        let second = limiter.status("u-status").await.unwrap();
        assert_eq!(first.remaining, 4);
        assert_eq!(second.remaining, 4);

        limiter.reset("u-status").await.unwrap();
    }
}
