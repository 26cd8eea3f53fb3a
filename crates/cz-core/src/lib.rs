//! # cz-core
//!
//! Request governance core for CuisineZen: the pieces that stand between
//! inbound traffic and the backend's real work.
//!
//! - [`limiter`]: per-operation-class rate limiting, enforced across
//!   instances through a shared store with an in-process fallback.
//! - [`cache`]: a shared TTL cache with batch access, pattern
//!   invalidation, and single-flight recomputation under concurrent misses.
//! - [`cost`]: per-operation cost accounting feeding advisory reports and
//!   tuning recommendations.
//!
//! A request flows through them in that order: the limiter admits it, the
//! cache (often via `get_or_set`) short-circuits the expensive part, and
//! the ledger records what the invocation cost regardless of the path
//! taken.

pub mod cache;
pub mod cost;
pub mod limiter;

pub use cache::{Cache, CacheError, CacheStats, MemoryCache, RedisCache, RedisCacheConfig};
pub use cost::{CostConfig, CostLedger, CostReport, CostTrend, Recommendation};
pub use limiter::{
    LimitStatus, LimiterConfig, OperationClass, PolicySet, RateLimitError, RateLimitPolicy,
    RequestRateLimiter,
};
