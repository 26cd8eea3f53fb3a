//! Cost sample and report types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One recorded operation execution. Append-only; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSample {
    /// Name of the operation, e.g. `listProducts` or `extractMenu`.
    pub operation: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Memory allocated to the invocation, in MB.
    pub memory_mb: f64,
    /// Estimated monetary cost of the invocation, in dollars.
    pub estimated_cost: f64,
    /// When the sample was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Direction of an operation's cost over the analysis window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostTrend {
    /// Second-half mean cost at least 10% above the first-half mean.
    Increasing,
    /// Second-half mean cost at least 10% below the first-half mean.
    Decreasing,
    /// Neither, or too few samples to say (fewer than 10).
    Stable,
}

/// Aggregated costs for one operation over an analysis window.
#[derive(Debug, Clone, Serialize)]
pub struct OperationCostReport {
    /// The operation name.
    pub operation: String,
    /// Sum of estimated costs.
    pub total_cost: f64,
    /// Number of samples.
    pub invocations: u64,
    /// Mean cost per invocation.
    pub avg_cost: f64,
    /// Mean duration in milliseconds.
    pub avg_duration_ms: f64,
    /// Mean memory in MB.
    pub avg_memory_mb: f64,
    /// Cost direction across the window.
    pub trend: CostTrend,
}

/// The full output of an analysis pass.
#[derive(Debug, Clone, Serialize)]
pub struct CostReport {
    /// Length of the analysis window in hours.
    pub window_hours: u32,
    /// Total estimated cost across every operation.
    pub total_cost: f64,
    /// Per-operation breakdowns, highest total cost first.
    pub operations: Vec<OperationCostReport>,
    /// Whether the window total exceeds the configured daily budget.
    /// Advisory only; nothing is blocked.
    pub over_daily_budget: bool,
}

/// What a recommendation proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    /// Memory allocation far exceeds what the short runtime suggests.
    RightSizeMemory,
    /// Expensive and frequent; a cache in front would absorb most calls.
    AddCaching,
    /// Very frequent and very short; callers should batch.
    BatchRequests,
    /// Long average runtime; optimize the operation or cut its timeout.
    OptimizeDuration,
}

impl RecommendationKind {
    /// Human-readable summary for dashboards.
    pub fn summary(&self) -> &'static str {
        match self {
            RecommendationKind::RightSizeMemory => {
                "memory allocation exceeds what the runtime needs; allocate less"
            }
            RecommendationKind::AddCaching => {
                "high per-invocation cost at high volume; cache the result"
            }
            RecommendationKind::BatchRequests => {
                "very high call volume of a very short operation; batch calls"
            }
            RecommendationKind::OptimizeDuration => {
                "long average runtime; optimize the operation or reduce its timeout"
            }
        }
    }
}

/// An advisory tuning suggestion derived from recorded samples.
///
/// Recommendations never change running limits; they exist for a human (or
/// an explicitly gated automation) to act on.
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    /// The operation the suggestion applies to.
    pub operation: String,
    /// What to do.
    pub kind: RecommendationKind,
    /// Rough share of the operation's cost the change could save.
    pub estimated_savings_pct: u8,
    /// Relative urgency; higher is more urgent.
    pub priority: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_serializes() {
        let sample = CostSample {
            operation: "listProducts".to_string(),
            duration_ms: 120,
            memory_mb: 256.0,
            estimated_cost: 0.000_001,
            recorded_at: Utc::now(),
        };
        let json = serde_json::to_string(&sample).unwrap();
        assert!(json.contains("listProducts"));
    }

    #[test]
    fn test_trend_snake_case() {
        assert_eq!(
            serde_json::to_string(&CostTrend::Increasing).unwrap(),
            "\"increasing\""
        );
    }

    #[test]
    fn test_recommendation_summaries_nonempty() {
        for kind in [
            RecommendationKind::RightSizeMemory,
            RecommendationKind::AddCaching,
            RecommendationKind::BatchRequests,
            RecommendationKind::OptimizeDuration,
        ] {
            assert!(!kind.summary().is_empty());
        }
    }
}
