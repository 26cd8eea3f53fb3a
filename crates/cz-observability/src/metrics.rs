//! Metric registration for the governance layer.
//!
//! The limiter, cache, and cost ledger emit these metrics at their call
//! sites; registering descriptions here once at startup gives the scrape
//! endpoint meaningful help text.

use metrics::{describe_counter, describe_gauge, describe_histogram};

/// Registers descriptions for every metric the governance layer emits.
/// Call once during server initialization.
pub fn register_governance_metrics() {
    // Rate limiter.
    describe_counter!(
        "cz_requests_admitted_total",
        "Requests admitted by the rate limiter, by operation class"
    );
    describe_counter!(
        "cz_requests_denied_total",
        "Requests denied by the rate limiter, by operation class"
    );
    describe_counter!(
        "cz_rate_limiter_fallback_total",
        "Checks that degraded to in-process enforcement because the shared store was unreachable"
    );
    describe_counter!(
        "cz_rate_limiter_evictions_total",
        "Identifiers evicted from the bounded window map"
    );
    describe_gauge!(
        "cz_rate_limiter_tracked_keys",
        "Identifiers currently tracked by the in-process window map"
    );

    // Cache.
    describe_counter!("cz_cache_hits_total", "Cache reads served from the cache");
    describe_counter!(
        "cz_cache_misses_total",
        "Cache reads that fell through to the caller"
    );
    describe_counter!(
        "cz_cache_invalidated_keys_total",
        "Keys removed by pattern invalidation"
    );
    describe_counter!(
        "cz_cache_lock_contention_total",
        "get_or_set attempts that found another caller's computation in flight"
    );
    describe_counter!(
        "cz_cache_lock_timeouts_total",
        "get_or_set calls that exhausted their lock wait budget"
    );

    // Cost ledger.
    describe_histogram!(
        "cz_operation_duration_seconds",
        "Wall-clock duration of recorded operations"
    );
    describe_histogram!(
        "cz_operation_cost_dollars",
        "Estimated cost of recorded operations"
    );
}
