//! Cache entry and statistics types.

use chrono::{DateTime, Utc};

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of reads served from the cache.
    pub hits: u64,
    /// Number of reads that fell through to the caller.
    pub misses: u64,
    /// Number of entries currently stored (approximate for shared backends).
    pub size: u64,
    /// `hits / (hits + misses)`, or 0.0 before any reads.
    pub hit_rate: f64,
}

impl CacheStats {
    /// Builds stats from raw counters, deriving the hit rate.
    pub fn new(hits: u64, misses: u64, size: u64) -> Self {
        let hit_rate = if hits + misses > 0 {
            hits as f64 / (hits + misses) as f64
        } else {
            0.0
        };

        Self {
            hits,
            misses,
            size,
            hit_rate,
        }
    }

    /// Total number of reads observed.
    pub fn total_reads(&self) -> u64 {
        self.hits + self.misses
    }
}

/// A single cached value with its expiry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The serialized value.
    pub value: Vec<u8>,
    /// When the entry expires; `None` means it never does.
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Creates an entry with the given expiry.
    pub fn new(value: Vec<u8>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self { value, expires_at }
    }

    /// Returns true once the entry's TTL has elapsed.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires) => Utc::now() >= expires,
            None => false,
        }
    }
}

/// Matches a key against a Redis-style glob pattern.
///
/// Supports `*` (any run of characters, including empty) and `?` (exactly
/// one character), which is the subset the invalidation paths use. Character
/// classes are not supported.
pub fn pattern_matches(pattern: &str, candidate: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let c: Vec<char> = candidate.chars().collect();

    // Iterative wildcard match with single-star backtracking.
    let (mut pi, mut ci) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ci < c.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == c[ci]) {
            pi += 1;
            ci += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ci));
            pi += 1;
        } else if let Some((sp, sc)) = star {
            pi = sp + 1;
            ci = sc + 1;
            star = Some((sp, sc + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }

    pi == p.len()
}
