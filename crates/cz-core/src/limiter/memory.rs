//! In-process rate limiter.
//!
//! Same admission contract as the distributed limiter (fixed windows,
//! penalty blocks, variable-point consumption) backed purely by process
//! memory. The facade switches to this limiter whenever the shared store is
//! unreachable, and uses it exclusively when no store is configured.
//!
//! The guarantee is deliberately weaker than the distributed limiter's:
//! windows are per instance, so with N instances behind a load balancer the
//! effective global budget is N times the configured one. That is the
//! availability tradeoff: the limiter must never become the outage.

use super::error::RateLimitError;
use super::policy::{LimitStatus, OperationClass, RateLimitPolicy};
use super::window::FixedWindowCounter;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Per-instance fallback limiter for one operation class.
///
/// Cloning shares state, so clones handed to sweep tasks or middleware see
/// the same windows and blocks.
#[derive(Debug, Clone)]
pub struct MemoryRateLimiter {
    class: OperationClass,
    policy: RateLimitPolicy,
    counter: FixedWindowCounter,
    /// Identifiers serving a penalty, with the penalty expiry.
    blocks: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl MemoryRateLimiter {
    /// Creates a limiter enforcing `policy` for `class`.
    pub fn new(class: OperationClass, policy: RateLimitPolicy) -> Self {
        Self {
            class,
            policy,
            counter: FixedWindowCounter::new(policy.max_points, policy.window),
            blocks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Consumes one point for the identifier.
    pub fn check(&self, identifier: &str) -> Result<(), RateLimitError> {
        self.check_n(identifier, 1, None)
    }

    /// Consumes `points`, optionally against an overridden budget.
    ///
    /// Checks the penalty table first: a blocked identifier is denied for
    /// the remainder of its penalty regardless of the window state. On a
    /// fresh exhaustion of a policy with a block duration, the penalty is
    /// recorded so it outlives the counting window.
    pub fn check_n(
        &self,
        identifier: &str,
        points: u32,
        budget_override: Option<u32>,
    ) -> Result<(), RateLimitError> {
        let now = Utc::now();

        if let Some(blocked_until) = self.blocked_until(identifier, now) {
            return Err(RateLimitError::LimitExceeded {
                retry_after: (blocked_until - now).to_std().unwrap_or(Duration::ZERO),
            });
        }

        let budget = budget_override.unwrap_or(self.policy.max_points);
        if self
            .counter
            .try_consume_with_budget(identifier, points, budget)
        {
            return Ok(());
        }

        let mut retry_after = self.counter.info(identifier).reset_after();

        if let Some(block) = self.policy.block {
            let blocked_until =
                now + ChronoDuration::milliseconds(block.as_millis() as i64);
            self.blocks
                .lock()
                .expect("block table poisoned")
                .entry(identifier.to_string())
                .or_insert(blocked_until);
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
    pub fn status(&self, identifier: &str) -> LimitStatus {
        let now = Utc::now();
        let info = self.counter.info(identifier);

        LimitStatus {
            class: self.class,
            limit: info.limit,
            remaining: info.remaining,
            reset_after: info.reset_after(),
            blocked_for: self
                .blocked_until(identifier, now)
                .map(|until| (until - now).to_std().unwrap_or(Duration::ZERO)),
        }
    }

    /// Clears the identifier's window and any penalty.
    pub fn reset(&self, identifier: &str) {
        self.counter.reset(identifier);
        self.blocks
            .lock()
            .expect("block table poisoned")
            .remove(identifier);
    }

    /// Reclaims expired windows and lapsed penalties.
    pub fn sweep(&self) -> usize {
        let removed = self.counter.sweep();
        let now = Utc::now();
        self.blocks
            .lock()
            .expect("block table poisoned")
            .retain(|_, until| *until > now);
        removed
    }

    /// The policy this limiter enforces.
    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    fn blocked_until(&self, identifier: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let blocks = self.blocks.lock().expect("block table poisoned");
        blocks
            .get(identifier)
            .copied()
            .filter(|until| *until > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(points: u32, window_ms: u64) -> MemoryRateLimiter {
        MemoryRateLimiter::new(
            OperationClass::Api,
            RateLimitPolicy::new(points, Duration::from_millis(window_ms)),
        )
    }

    #[test]
    fn test_admits_budget_then_denies() {
        let limiter = limiter(3, 60_000);

        for _ in 0..3 {
            assert!(limiter.check("u1").is_ok());
        }

        let denied = limiter.check("u1").unwrap_err();
        let retry = denied.retry_after_secs().unwrap();
        assert!(retry >= 55 && retry <= 60, "retry_after was {retry}");
    }

    #[test]
    fn test_window_reset_restores_budget() {
        let limiter = limiter(1, 30);

        assert!(limiter.check("u1").is_ok());
        assert!(limiter.check("u1").is_err());

        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.check("u1").is_ok());
    }

    #[test]
    fn test_block_outlives_window() {
        let limiter = MemoryRateLimiter::new(
            OperationClass::Mutation,
            RateLimitPolicy::new(1, Duration::from_millis(30))
                .with_block(Duration::from_secs(60)),
        );

        assert!(limiter.check("u1").is_ok());
        assert!(limiter.check("u1").is_err());

        // The counting window has long reset, but the penalty holds.
        std::thread::sleep(Duration::from_millis(60));
        let denied = limiter.check("u1").unwrap_err();
        assert!(denied.retry_after_secs().unwrap() > 30);
    }

    #[test]
    fn test_block_retry_after_reflects_block() {
        let limiter = MemoryRateLimiter::new(
            OperationClass::Auth,
            RateLimitPolicy::new(1, Duration::from_secs(10))
                .with_block(Duration::from_secs(120)),
        );

        assert!(limiter.check("u1").is_ok());
        let denied = limiter.check_n("u1", 1, None).unwrap_err();
        let retry = denied.retry_after_secs().unwrap();
        assert!(retry > 100, "retry should reflect the block, was {retry}");
    }

    #[test]
    fn test_status_read_only() {
        let limiter = limiter(5, 60_000);
        limiter.check("u1").unwrap();

        let status = limiter.status("u1");
        assert_eq!(status.limit, 5);
        assert_eq!(status.remaining, 4);
        assert!(status.blocked_for.is_none());

        // Reading twice must not consume.
        assert_eq!(limiter.status("u1").remaining, 4);
    }

    #[test]
    fn test_status_reports_block() {
        let limiter = MemoryRateLimiter::new(
            OperationClass::Auth,
            RateLimitPolicy::new(1, Duration::from_secs(10))
                .with_block(Duration::from_secs(120)),
        );

        limiter.check("u1").unwrap();
        let _ = limiter.check("u1");

        let status = limiter.status("u1");
        assert!(status.blocked_for.is_some());
    }

    #[test]
    fn test_reset_clears_block() {
        let limiter = MemoryRateLimiter::new(
            OperationClass::Auth,
            RateLimitPolicy::new(1, Duration::from_secs(10))
                .with_block(Duration::from_secs(120)),
        );

        limiter.check("u1").unwrap();
        let _ = limiter.check("u1");
        assert!(limiter.check("u1").is_err());

        limiter.reset("u1");
        assert!(limiter.check("u1").is_ok());
    }

    #[test]
    fn test_variable_point_consumption() {
        let limiter = limiter(10, 60_000);

        assert!(limiter.check_n("u1", 8, None).is_ok());
        assert!(limiter.check_n("u1", 5, None).is_err());
        assert!(limiter.check_n("u1", 2, None).is_ok());
    }

    #[test]
    fn test_sweep_drops_lapsed_penalties() {
        let limiter = MemoryRateLimiter::new(
            OperationClass::Mutation,
            RateLimitPolicy::new(1, Duration::from_millis(20))
                .with_block(Duration::from_millis(30)),
        );

        limiter.check("u1").unwrap();
        let _ = limiter.check("u1");

        std::thread::sleep(Duration::from_millis(60));
        limiter.sweep();
        assert!(limiter.check("u1").is_ok());
    }
}
