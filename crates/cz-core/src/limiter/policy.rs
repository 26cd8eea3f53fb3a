//! Operation classes and their rate-limit policies.
//!
//! Every inbound request belongs to exactly one [`OperationClass`]; the
//! [`PolicySet`] maps each class to its budget. The set is closed and
//! validated at startup, so an unknown class or a zero budget is a
//! construction error rather than a runtime surprise.

use super::error::RateLimitError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// The categories of request the backend distinguishes for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    /// General read API traffic (product/recipe listings).
    Api,
    /// Writes: creating and editing products, recipes, batches.
    Mutation,
    /// Sign-in and token refresh attempts.
    Auth,
    /// Image and menu uploads.
    Upload,
    /// Analytics and report generation.
    Analytics,
    /// Free-text inventory search.
    Search,
    /// Endpoints whose per-request cost varies; budget consumed in points.
    CostWeighted,
}

impl OperationClass {
    /// Every class, for iteration over the full policy table.
    pub const ALL: [OperationClass; 7] = [
        OperationClass::Api,
        OperationClass::Mutation,
        OperationClass::Auth,
        OperationClass::Upload,
        OperationClass::Analytics,
        OperationClass::Search,
        OperationClass::CostWeighted,
    ];

    /// Stable short name used in store keys and log fields.
    pub fn key_segment(&self) -> &'static str {
        match self {
            OperationClass::Api => "api",
            OperationClass::Mutation => "mutation",
            OperationClass::Auth => "auth",
            OperationClass::Upload => "upload",
            OperationClass::Analytics => "analytics",
            OperationClass::Search => "search",
            OperationClass::CostWeighted => "cost",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key_segment())
    }
}

/// Budget for one operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Points admitted per window. Most classes consume one point per
    /// request; the cost-weighted class consumes a caller-supplied amount.
    pub max_points: u32,
    /// Length of the fixed counting window.
    pub window: Duration,
    /// Optional penalty applied on exhaustion: further requests are denied
    /// for this long even after the counting window resets.
    pub block: Option<Duration>,
}

impl RateLimitPolicy {
    /// Creates a policy with no penalty block.
    pub fn new(max_points: u32, window: Duration) -> Self {
        Self {
            max_points,
            window,
            block: None,
        }
    }

    /// Adds a penalty block to the policy.
    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = Some(block);
        self
    }
}

/// A read-only snapshot of one identifier's standing against a policy.
#[derive(Debug, Clone, Serialize)]
pub struct LimitStatus {
    /// The class the snapshot describes.
    pub class: OperationClass,
    /// Points admitted per window.
    pub limit: u32,
    /// Points still available in the current window.
    pub remaining: u32,
    /// Time until the current window resets (zero if no window is open).
    pub reset_after: Duration,
    /// Remaining penalty time, if the identifier is currently blocked.
    pub blocked_for: Option<Duration>,
}

/// The complete class-to-policy table.
#[derive(Debug, Clone)]
pub struct PolicySet {
    policies: HashMap<OperationClass, RateLimitPolicy>,
}

impl PolicySet {
    /// Replaces the policy for one class.
    pub fn with(mut self, class: OperationClass, policy: RateLimitPolicy) -> Self {
        self.policies.insert(class, policy);
        self
    }

    /// Returns the policy for a class.
    ///
    /// The table is complete by construction, so this falls back to the
    /// general API policy only if a caller built a set through `with` after
    /// removing entries, which the API does not allow.
    pub fn policy(&self, class: OperationClass) -> RateLimitPolicy {
        self.policies
            .get(&class)
            .or_else(|| self.policies.get(&OperationClass::Api))
            .copied()
            .unwrap_or(RateLimitPolicy::new(100, Duration::from_secs(60)))
    }

    /// Rejects empty budgets and windows. Called by the facade constructor.
    pub fn validate(&self) -> Result<(), RateLimitError> {
        for class in OperationClass::ALL {
            let policy = self.policy(class);
            if policy.max_points == 0 {
                return Err(RateLimitError::InvalidConfig(format!(
                    "class '{class}' has a zero point budget"
                )));
            }
            if policy.window.is_zero() {
                return Err(RateLimitError::InvalidConfig(format!(
                    "class '{class}' has a zero-length window"
                )));
            }
            if let Some(block) = policy.block {
                if block.is_zero() {
                    return Err(RateLimitError::InvalidConfig(format!(
                        "class '{class}' has a zero-length block duration"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for PolicySet {
    /// The production defaults. Auth is strictest (credential stuffing),
    /// mutations and auth carry penalty blocks, and the cost-weighted class
    /// hands out a large hourly point pool.
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            OperationClass::Api,
            RateLimitPolicy::new(100, Duration::from_secs(60)),
        );
        policies.insert(
            OperationClass::Mutation,
            RateLimitPolicy::new(20, Duration::from_secs(60))
                .with_block(Duration::from_secs(120)),
        );
        policies.insert(
            OperationClass::Auth,
            RateLimitPolicy::new(5, Duration::from_secs(300))
                .with_block(Duration::from_secs(900)),
        );
        policies.insert(
            OperationClass::Upload,
            RateLimitPolicy::new(10, Duration::from_secs(60)),
        );
        policies.insert(
            OperationClass::Analytics,
            RateLimitPolicy::new(5, Duration::from_secs(60)),
        );
        policies.insert(
            OperationClass::Search,
            RateLimitPolicy::new(30, Duration::from_secs(60)),
        );
        policies.insert(
            OperationClass::CostWeighted,
            RateLimitPolicy::new(500, Duration::from_secs(3600)),
        );
        Self { policies }
    }
}
