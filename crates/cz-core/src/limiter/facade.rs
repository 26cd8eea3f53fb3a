//! Request-level rate limiting facade.
//!
//! The single entry point request handlers call before doing work. Routes
//! each check to the right per-class limiter, composes the user-level and
//! IP-level budgets, and turns exhaustion into a retry-after contract.
//!
//! Failure posture: enforcement degrades before availability does. A
//! shared-store outage switches the affected class to its in-process
//! fallback (weaker, per-instance enforcement); an unexpected internal
//! error admits the request after logging it. Only genuine budget
//! exhaustion reaches the caller as an error.

use super::error::RateLimitError;
use super::memory::MemoryRateLimiter;
use super::policy::{LimitStatus, OperationClass, PolicySet};
use super::redis::RedisRateLimiter;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

/// Configuration for [`RequestRateLimiter`].
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Shared-store URL. `None` runs in-process only.
    pub redis_url: Option<String>,
    /// Maximum pooled connections to the shared store.
    pub max_connections: u32,
    /// Prefix for every limiter key in the shared store.
    pub key_prefix: String,
    /// Lowest effective budget the adaptive check will scale down to.
    pub adaptive_min_budget: u32,
}

impl LimiterConfig {
    /// In-process-only configuration.
    pub fn in_process() -> Self {
        Self {
            redis_url: None,
            max_connections: 16,
            key_prefix: "cz:rl".to_string(),
            adaptive_min_budget: 10,
        }
    }

    /// Configuration backed by the shared store at `url`.
    pub fn with_redis(url: impl Into<String>) -> Self {
        Self {
            redis_url: Some(url.into()),
            ..Self::in_process()
        }
    }

    /// Sets the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Sets the adaptive floor.
    pub fn with_adaptive_min_budget(mut self, min: u32) -> Self {
        self.adaptive_min_budget = min;
        self
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self::in_process()
    }
}

/// The distributed limiter and its always-available fallback for one class.
#[derive(Debug, Clone)]
struct ClassLimiter {
    distributed: Option<RedisRateLimiter>,
    fallback: MemoryRateLimiter,
}

/// Per-operation-class rate limiting over a user and IP principal.
///
/// Construct once at process start and share (it is cheaply cloneable);
/// per-test instances give tests isolated windows.
#[derive(Debug, Clone)]
pub struct RequestRateLimiter {
    classes: HashMap<OperationClass, ClassLimiter>,
    policies: PolicySet,
    adaptive_min_budget: u32,
}

impl RequestRateLimiter {
    /// Creates a limiter with no shared store: enforcement is per instance.
    pub fn in_process(policies: PolicySet) -> Result<Self, RateLimitError> {
        Self::build(LimiterConfig::in_process(), policies, None)
    }

    /// Creates a limiter from configuration, connecting to the shared store
    /// when one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::InvalidConfig`] for a bad policy table and
    /// [`RateLimitError::StoreUnavailable`] if the configured store cannot
    /// be reached at startup.
    pub async fn new(config: LimiterConfig, policies: PolicySet) -> Result<Self, RateLimitError> {
        let pool = match &config.redis_url {
            Some(url) => Some(Self::connect(url, config.max_connections).await?),
            None => None,
        };
        Self::build(config, policies, pool)
    }

    /// Creates a limiter over an existing shared-store pool.
    ///
    /// Unlike [`new`](Self::new), the store is not health-checked up front;
    /// an unreachable store degrades to in-process enforcement on every
    /// check until it comes back.
    pub fn from_pool(
        config: LimiterConfig,
        policies: PolicySet,
        pool: Pool,
    ) -> Result<Self, RateLimitError> {
        Self::build(config, policies, Some(pool))
    }

    async fn connect(url: &str, max_connections: u32) -> Result<Pool, RateLimitError> {
        let pool = PoolConfig::from_url(url)
            .builder()
            .map_err(|e| {
                RateLimitError::StoreUnavailable(format!("failed to create pool config: {e}"))
            })?
            .max_size(max_connections as usize)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| RateLimitError::StoreUnavailable(format!("failed to build pool: {e}")))?;

        let mut conn = pool.get().await.map_err(|e| {
            RateLimitError::StoreUnavailable(format!("failed to get connection: {e}"))
        })?;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| RateLimitError::StoreUnavailable(format!("redis PING failed: {e}")))?;

        Ok(pool)
    }

    fn build(
        config: LimiterConfig,
        policies: PolicySet,
        pool: Option<Pool>,
    ) -> Result<Self, RateLimitError> {
        policies.validate()?;

        let mut classes = HashMap::new();
        for class in OperationClass::ALL {
            let policy = policies.policy(class);
            classes.insert(
                class,
                ClassLimiter {
                    distributed: pool
                        .as_ref()
                        .map(|p| {
                            RedisRateLimiter::new(p.clone(), config.key_prefix.clone(), class, policy)
                        }),
                    fallback: MemoryRateLimiter::new(class, policy),
                },
            );
        }

        Ok(Self {
            classes,
            policies,
            adaptive_min_budget: config.adaptive_min_budget,
        })
    }

    fn class_limiter(&self, class: OperationClass) -> &ClassLimiter {
        self.classes
            .get(&class)
            .expect("every operation class is populated at construction")
    }

    /// Checks one store key against one class, degrading to the fallback
    /// limiter on store failure and failing open on anything unexpected.
    async fn check_key(
        &self,
        class: OperationClass,
        key: &str,
        points: u32,
        budget_override: Option<u32>,
    ) -> Result<(), RateLimitError> {
        let limiter = self.class_limiter(class);

        if let Some(distributed) = &limiter.distributed {
            match distributed.check_n(key, points, budget_override).await {
                Ok(()) => return Ok(()),
                Err(denied @ RateLimitError::LimitExceeded { .. }) => return Err(denied),
                Err(RateLimitError::StoreUnavailable(reason)) => {
                    tracing::warn!(
                        class = %class,
                        reason,
                        "rate limit store unavailable, degrading to in-process enforcement"
                    );
                    metrics::counter!("cz_rate_limiter_fallback_total").increment(1);
                }
                Err(err) => {
                    // A limiter defect must not become a product outage.
                    tracing::error!(class = %class, error = %err, "unexpected rate limiter error, admitting request");
                    return Ok(());
                }
            }
        }

        limiter.fallback.check_n(key, points, budget_override)
    }

    /// Checks both principals of a request against one class. Both the IP
    /// budget and the user budget must admit.
    async fn check_principals(
        &self,
        user_id: &str,
        ip: IpAddr,
        class: OperationClass,
        points: u32,
        budget_override: Option<u32>,
    ) -> Result<(), RateLimitError> {
        let result = async {
            self.check_key(class, &format!("ip:{ip}"), points, budget_override)
                .await?;
            self.check_key(class, &format!("user:{user_id}"), points, budget_override)
                .await
        }
        .await;

        match &result {
            Ok(()) => {
                metrics::counter!("cz_requests_admitted_total", "class" => class.key_segment())
                    .increment(1);
            }
            Err(err) => {
                metrics::counter!("cz_requests_denied_total", "class" => class.key_segment())
                    .increment(1);
                tracing::warn!(
                    class = %class,
                    user_id,
                    ip = %ip,
                    retry_after_secs = err.retry_after_secs().unwrap_or(0),
                    "request denied by rate limiter"
                );
            }
        }

        result
    }

    /// Checks a request against an operation class.
    pub async fn check(
        &self,
        user_id: &str,
        ip: IpAddr,
        class: OperationClass,
    ) -> Result<(), RateLimitError> {
        self.check_principals(user_id, ip, class, 1, None).await
    }

    /// General read API traffic.
    pub async fn check_api(&self, user_id: &str, ip: IpAddr) -> Result<(), RateLimitError> {
        self.check(user_id, ip, OperationClass::Api).await
    }

    /// Product/recipe/batch writes.
    pub async fn check_mutation(&self, user_id: &str, ip: IpAddr) -> Result<(), RateLimitError> {
        self.check(user_id, ip, OperationClass::Mutation).await
    }

    /// Sign-in and token refresh.
    pub async fn check_auth(&self, user_id: &str, ip: IpAddr) -> Result<(), RateLimitError> {
        self.check(user_id, ip, OperationClass::Auth).await
    }

    /// Image and menu uploads.
    pub async fn check_upload(&self, user_id: &str, ip: IpAddr) -> Result<(), RateLimitError> {
        self.check(user_id, ip, OperationClass::Upload).await
    }

    /// Analytics and report generation.
    pub async fn check_analytics(&self, user_id: &str, ip: IpAddr) -> Result<(), RateLimitError> {
        self.check(user_id, ip, OperationClass::Analytics).await
    }

    /// Free-text inventory search.
    pub async fn check_search(&self, user_id: &str, ip: IpAddr) -> Result<(), RateLimitError> {
        self.check(user_id, ip, OperationClass::Search).await
    }

    /// Load-adaptive admission on the general API class.
    ///
    /// Scales the effective budget down with the supplied load signal:
    /// `max(floor(base × (1 − 0.5 × load)), min_budget)`, `load` clamped to
    /// [0, 1]. This is coarse admission control: the endpoint sheds traffic
    /// ahead of hard failure, it does not push back on producers.
    pub async fn check_adaptive(
        &self,
        user_id: &str,
        ip: IpAddr,
        system_load: f64,
    ) -> Result<(), RateLimitError> {
        let load = system_load.clamp(0.0, 1.0);
        let base = self.policies.policy(OperationClass::Api).max_points;
        let scaled = (base as f64 * (1.0 - 0.5 * load)).floor() as u32;
        let effective = scaled.max(self.adaptive_min_budget);

        self.check_principals(user_id, ip, OperationClass::Api, 1, Some(effective))
            .await
    }

    /// Variable-cost admission: consumes `points` from the user's
    /// cost-weighted budget. For endpoints whose resource cost varies per
    /// request (report exports, bulk imports).
    pub async fn check_cost_weighted(
        &self,
        user_id: &str,
        points: u32,
    ) -> Result<(), RateLimitError> {
        let result = self
            .check_key(
                OperationClass::CostWeighted,
                &format!("user:{user_id}"),
                points,
                None,
            )
            .await;

        match &result {
            Ok(()) => {
                metrics::counter!("cz_requests_admitted_total", "class" => "cost").increment(1);
            }
            Err(err) => {
                metrics::counter!("cz_requests_denied_total", "class" => "cost").increment(1);
                tracing::warn!(
                    user_id,
                    points,
                    retry_after_secs = err.retry_after_secs().unwrap_or(0),
                    "cost-weighted request denied"
                );
            }
        }

        result
    }

    /// Read-only standing of a user against one class. Never consumes.
    pub async fn limit_status(&self, user_id: &str, class: OperationClass) -> LimitStatus {
        let limiter = self.class_limiter(class);
        let key = format!("user:{user_id}");

        if let Some(distributed) = &limiter.distributed {
            match distributed.status(&key).await {
                Ok(status) => return status,
                Err(err) => {
                    tracing::warn!(class = %class, error = %err, "status read failed, reporting in-process view");
                }
            }
        }

        limiter.fallback.status(&key)
    }

    /// Administrative override: clears every class window and penalty for a
    /// user, in the shared store and in process.
    pub async fn reset_limits(&self, user_id: &str) {
        let key = format!("user:{user_id}");

        for class in OperationClass::ALL {
            let limiter = self.class_limiter(class);
            if let Some(distributed) = &limiter.distributed {
                if let Err(err) = distributed.reset(&key).await {
                    tracing::warn!(class = %class, error = %err, "shared-store reset failed");
                }
            }
            limiter.fallback.reset(&key);
        }

        tracing::info!(user_id, "rate limits reset");
    }

    /// Spawns a task reclaiming expired in-process windows and penalties on
    /// an interval.
    pub fn spawn_sweep_task(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let mut removed = 0;
                for class_limiter in limiter.classes.values() {
                    removed += class_limiter.fallback.sweep();
                }
                tracing::debug!(removed, "rate limiter sweep completed");
            }
        })
    }
}
