//! Rate limiter error types.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the rate limiting layer.
///
/// Only `LimitExceeded` is meant for end callers; the facade recovers
/// `StoreUnavailable` by degrading to in-process enforcement, and
/// `InvalidConfig` can only occur at construction time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// The caller exhausted its budget. Retry after the given duration.
    #[error("too many requests, retry after {}s", retry_after.as_secs().max(1))]
    LimitExceeded {
        /// How long until the window resets or the block expires.
        retry_after: Duration,
    },

    /// The shared store behind the distributed limiter is unreachable.
    #[error("rate limit store unavailable: {0}")]
    StoreUnavailable(String),

    /// A policy or limiter configuration failed validation.
    #[error("invalid rate limit configuration: {0}")]
    InvalidConfig(String),
}

impl RateLimitError {
    /// Retry-After in whole seconds (rounded up, minimum 1), suitable for
    /// an HTTP `Retry-After` header. `None` for non-exhaustion errors.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            RateLimitError::LimitExceeded { retry_after } => {
                Some((retry_after.as_millis() as u64).div_ceil(1000).max(1))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_rounds_up() {
        let err = RateLimitError::LimitExceeded {
            retry_after: Duration::from_millis(1200),
        };
        assert_eq!(err.retry_after_secs(), Some(2));
    }

    #[test]
    fn test_retry_after_minimum_one_second() {
        let err = RateLimitError::LimitExceeded {
            retry_after: Duration::from_millis(10),
        };
        assert_eq!(err.retry_after_secs(), Some(1));
    }

    #[test]
    fn test_non_exhaustion_has_no_retry_after() {
        let err = RateLimitError::StoreUnavailable("connection refused".to_string());
        assert_eq!(err.retry_after_secs(), None);
        assert!(err.to_string().contains("connection refused"));
    }
}
