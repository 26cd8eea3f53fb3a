//! Per-operation-class rate limiting.
//!
//! Admission control for every inbound request, enforced across instances
//! through the shared store and per instance when the store is away:
//!
//! ```text
//!     request (user id + IP)
//!            │
//!            ▼
//!     RequestRateLimiter ── routes by OperationClass, checks both principals
//!            │
//!            ├─ RedisRateLimiter ──── shared-store windows + penalty blocks
//!            │        │ store unreachable
//!            │        ▼
//!            └─ MemoryRateLimiter ── per-instance fallback
//!                     │
//!                     └─ FixedWindowCounter ── keyed fixed windows
//! ```
//!
//! Callers receive [`RateLimitError::LimitExceeded`] with retry metadata on
//! exhaustion; store failures degrade enforcement instead of failing the
//! request.

mod error;
mod facade;
mod memory;
mod policy;
mod redis;
mod window;

pub use error::RateLimitError;
pub use facade::{LimiterConfig, RequestRateLimiter};
pub use memory::MemoryRateLimiter;
pub use policy::{LimitStatus, OperationClass, PolicySet, RateLimitPolicy};
pub use self::redis::RedisRateLimiter;
pub use window::{
    FixedWindowCounter, WindowInfo, DEFAULT_MAX_TRACKED_KEYS, MAX_TRACKED_KEYS_ENV,
};
