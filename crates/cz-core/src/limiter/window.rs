//! Keyed fixed-window request counter.
//!
//! One window per identifier: the first request opens a window of
//! `{count, reset_at}`, requests inside it consume points until the budget
//! is spent, and a request after `reset_at` replaces the window. This is a
//! fixed window, not a sliding one: an identifier can burst up to twice
//! its budget across a window edge. That approximation is accepted: the
//! counter exists to bound cost, not to meter traffic exactly, and a fixed
//! window keeps the bookkeeping to one counter and one timestamp.
//!
//! State is per-process. The identifier map is LRU-bounded so an attacker
//! cycling identifiers cannot exhaust memory; capacity comes from
//! `GOVERNANCE_MAX_TRACKED_KEYS` (default 10 000) and evictions are counted
//! in metrics.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Environment variable overriding the maximum number of tracked identifiers.
pub const MAX_TRACKED_KEYS_ENV: &str = "GOVERNANCE_MAX_TRACKED_KEYS";

/// Default maximum number of tracked identifiers.
pub const DEFAULT_MAX_TRACKED_KEYS: usize = 10_000;

fn max_tracked_keys() -> usize {
    std::env::var(MAX_TRACKED_KEYS_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_TRACKED_KEYS)
}

/// One identifier's open window.
#[derive(Debug, Clone, Copy)]
struct WindowState {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// Read-only view of one identifier's window.
#[derive(Debug, Clone, Copy)]
pub struct WindowInfo {
    /// Points admitted per window.
    pub limit: u32,
    /// Points still available in the current window.
    pub remaining: u32,
    /// When the current window resets. In the past (or now) if no window
    /// is open for the identifier.
    pub reset_at: DateTime<Utc>,
}

impl WindowInfo {
    /// Time until the window resets, zero if it already has.
    pub fn reset_after(&self) -> Duration {
        (self.reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Fixed-window counter over arbitrary string identifiers.
///
/// Cloning shares the underlying window map, so a clone handed to a sweep
/// task observes the same state.
#[derive(Debug, Clone)]
pub struct FixedWindowCounter {
    windows: Arc<Mutex<LruCache<String, WindowState>>>,
    max_points: u32,
    window: Duration,
    capacity: usize,
    evictions: Arc<AtomicU64>,
}

impl FixedWindowCounter {
    /// Creates a counter with the given budget and window, capacity from
    /// the environment.
    pub fn new(max_points: u32, window: Duration) -> Self {
        Self::with_capacity(max_points, window, max_tracked_keys())
    }

    /// Creates a counter with an explicit identifier capacity.
    pub fn with_capacity(max_points: u32, window: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            windows: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("capacity clamped to >= 1"),
            ))),
            max_points,
            window,
            capacity,
            evictions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Consumes one point for the identifier. Returns whether it was admitted.
    pub fn try_consume(&self, identifier: &str) -> bool {
        self.try_consume_n(identifier, 1)
    }

    /// Consumes `points` for the identifier against the configured budget.
    pub fn try_consume_n(&self, identifier: &str, points: u32) -> bool {
        self.try_consume_with_budget(identifier, points, self.max_points)
    }

    /// Consumes `points` against an explicit budget (used by the adaptive
    /// admission path, where the effective budget varies with load).
    ///
    /// A denial does not consume: the window count is only advanced when the
    /// request is admitted.
    pub fn try_consume_with_budget(&self, identifier: &str, points: u32, budget: u32) -> bool {
        let now = Utc::now();
        let mut windows = self.windows.lock().expect("window map poisoned");

        if let Some(state) = windows.get_mut(identifier) {
            if now < state.reset_at {
                if state.count.saturating_add(points) > budget {
                    return false;
                }
                state.count += points;
                return true;
            }
            // Window elapsed: fall through and open a fresh one.
        }

        if points > budget {
            return false;
        }

        let was_full = windows.len() >= self.capacity && !windows.contains(identifier);
        windows.push(
            identifier.to_string(),
            WindowState {
                count: points,
                reset_at: now + ChronoDuration::milliseconds(self.window.as_millis() as i64),
            },
        );

        if was_full {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("cz_rate_limiter_evictions_total").increment(1);
            tracing::debug!(
                identifier,
                capacity = self.capacity,
                "window map full, evicted least recently used identifier"
            );
        }

        true
    }

    /// Reads the identifier's standing without consuming or promoting it.
    pub fn info(&self, identifier: &str) -> WindowInfo {
        let now = Utc::now();
        let windows = self.windows.lock().expect("window map poisoned");

        match windows.peek(identifier) {
            Some(state) if now < state.reset_at => WindowInfo {
                limit: self.max_points,
                remaining: self.max_points.saturating_sub(state.count),
                reset_at: state.reset_at,
            },
            _ => WindowInfo {
                limit: self.max_points,
                remaining: self.max_points,
                reset_at: now,
            },
        }
    }

    /// Clears one identifier's window (administrative override).
    pub fn reset(&self, identifier: &str) {
        let mut windows = self.windows.lock().expect("window map poisoned");
        windows.pop(identifier);
    }

    /// Drops every expired window and returns how many were removed.
    ///
    /// Expired windows are also replaced lazily on access; the sweep exists
    /// to reclaim identifiers that never come back.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut windows = self.windows.lock().expect("window map poisoned");

        let expired: Vec<String> = windows
            .iter()
            .filter(|(_, state)| now >= state.reset_at)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            windows.pop(key);
        }

        metrics::gauge!("cz_rate_limiter_tracked_keys").set(windows.len() as f64);
        expired.len()
    }

    /// Number of identifiers currently tracked.
    pub fn tracked(&self) -> usize {
        self.windows.lock().expect("window map poisoned").len()
    }

    /// Total LRU evictions since construction.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}
