//! The cost accounting ledger.

use super::types::{
    CostReport, CostSample, CostTrend, OperationCostReport, Recommendation, RecommendationKind,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// Samples below this count report a [`CostTrend::Stable`] trend.
const TREND_MIN_SAMPLES: usize = 10;

/// Relative change between window halves that counts as a trend.
const TREND_THRESHOLD: f64 = 0.10;

/// Configuration for [`CostLedger`].
#[derive(Debug, Clone)]
pub struct CostConfig {
    /// Price of one GB-second of compute, in dollars.
    pub gb_second_rate: f64,
    /// Fixed price of one invocation, in dollars.
    pub per_invocation_rate: f64,
    /// Maximum retained samples; the oldest are evicted past this.
    pub capacity: usize,
    /// Daily spend above which reports flag `over_daily_budget`.
    pub daily_budget: Option<f64>,
}

impl CostConfig {
    /// Sets the compute and invocation rates.
    pub fn with_rates(mut self, gb_second: f64, per_invocation: f64) -> Self {
        self.gb_second_rate = gb_second;
        self.per_invocation_rate = per_invocation;
        self
    }

    /// Sets the retained-sample capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Sets the advisory daily budget in dollars.
    pub fn with_daily_budget(mut self, budget: f64) -> Self {
        self.daily_budget = Some(budget);
        self
    }
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            // Serverless list pricing: $ per GB-second and $ per invocation.
            gb_second_rate: 0.000_016_666_7,
            per_invocation_rate: 0.000_000_2,
            capacity: 10_000,
            daily_budget: None,
        }
    }
}

/// Records per-operation resource usage and derives estimated spend.
///
/// State is a per-instance ring buffer: each backend instance sees only its
/// own invocations, which is enough for the advisory reports this feeds.
/// The ledger observes and recommends; it never changes a running limit or
/// cache policy.
#[derive(Debug)]
pub struct CostLedger {
    samples: RwLock<Vec<CostSample>>,
    config: CostConfig,
}

impl CostLedger {
    /// Creates a ledger with the given configuration.
    pub fn new(config: CostConfig) -> Self {
        Self {
            samples: RwLock::new(Vec::new()),
            config,
        }
    }

    /// Records one operation execution and returns its estimated cost.
    pub async fn record(&self, operation: &str, duration: Duration, memory_mb: f64) -> f64 {
        let duration_ms = duration.as_millis() as u64;
        let gb_seconds = (memory_mb / 1024.0) * (duration_ms as f64 / 1000.0);
        let estimated_cost =
            gb_seconds * self.config.gb_second_rate + self.config.per_invocation_rate;

        metrics::histogram!("cz_operation_duration_seconds", "operation" => operation.to_string())
            .record(duration.as_secs_f64());
        metrics::histogram!("cz_operation_cost_dollars", "operation" => operation.to_string())
            .record(estimated_cost);

        let mut samples = self.samples.write().await;
        samples.push(CostSample {
            operation: operation.to_string(),
            duration_ms,
            memory_mb,
            estimated_cost,
            recorded_at: Utc::now(),
        });

        // Ring-buffer semantics: drop the oldest once over capacity.
        if samples.len() > self.config.capacity {
            let excess = samples.len() - self.config.capacity;
            samples.drain(..excess);
        }

        estimated_cost
    }

    /// Number of retained samples.
    pub async fn len(&self) -> usize {
        self.samples.read().await.len()
    }

    /// Whether the ledger holds no samples.
    pub async fn is_empty(&self) -> bool {
        self.samples.read().await.is_empty()
    }

    /// Aggregates the samples of the last `window_hours` per operation.
    ///
    /// The per-operation trend compares the mean cost of the first half of
    /// the window's samples against the second half: a ±10% move is
    /// Increasing/Decreasing, anything else (or fewer than 10 samples) is
    /// Stable. When a daily budget is configured and the window covers at
    /// least a day, the report flags totals above it.
    pub async fn analyze(&self, window_hours: u32) -> CostReport {
        let cutoff = Utc::now() - ChronoDuration::hours(window_hours as i64);
        let samples = self.samples.read().await;

        let mut by_operation: HashMap<&str, Vec<&CostSample>> = HashMap::new();
        for sample in samples.iter().filter(|s| s.recorded_at >= cutoff) {
            by_operation
                .entry(sample.operation.as_str())
                .or_default()
                .push(sample);
        }

        let mut operations: Vec<OperationCostReport> = by_operation
            .into_iter()
            .map(|(operation, samples)| {
                let invocations = samples.len() as u64;
                let total_cost: f64 = samples.iter().map(|s| s.estimated_cost).sum();
                let avg_duration_ms = samples.iter().map(|s| s.duration_ms as f64).sum::<f64>()
                    / invocations as f64;
                let avg_memory_mb =
                    samples.iter().map(|s| s.memory_mb).sum::<f64>() / invocations as f64;

                OperationCostReport {
                    operation: operation.to_string(),
                    total_cost,
                    invocations,
                    avg_cost: total_cost / invocations as f64,
                    avg_duration_ms,
                    avg_memory_mb,
                    trend: Self::trend(&samples),
                }
            })
            .collect();

        operations.sort_by(|a, b| {
            b.total_cost
                .partial_cmp(&a.total_cost)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let total_cost: f64 = operations.iter().map(|o| o.total_cost).sum();
        let over_daily_budget = match self.config.daily_budget {
            Some(budget) if window_hours >= 24 => total_cost > budget,
            _ => false,
        };

        if over_daily_budget {
            tracing::warn!(
                total_cost,
                budget = self.config.daily_budget.unwrap_or_default(),
                "estimated spend exceeds the daily budget"
            );
        }

        CostReport {
            window_hours,
            total_cost,
            operations,
            over_daily_budget,
        }
    }

    /// Derives advisory tuning suggestions from the last day of samples,
    /// highest priority first.
    pub async fn recommendations(&self) -> Vec<Recommendation> {
        let report = self.analyze(24).await;
        let mut recommendations = Vec::new();

        for op in &report.operations {
            if op.avg_cost >= 0.000_1 && op.invocations >= 100 {
                recommendations.push(Recommendation {
                    operation: op.operation.clone(),
                    kind: RecommendationKind::AddCaching,
                    estimated_savings_pct: 40,
                    priority: 5,
                });
            }
            if op.avg_memory_mb >= 512.0 && op.avg_duration_ms < 1_000.0 {
                recommendations.push(Recommendation {
                    operation: op.operation.clone(),
                    kind: RecommendationKind::RightSizeMemory,
                    estimated_savings_pct: 30,
                    priority: 4,
                });
            }
            if op.invocations >= 1_000 && op.avg_duration_ms < 100.0 {
                recommendations.push(Recommendation {
                    operation: op.operation.clone(),
                    kind: RecommendationKind::BatchRequests,
                    estimated_savings_pct: 25,
                    priority: 3,
                });
            }
            if op.avg_duration_ms >= 5_000.0 {
                recommendations.push(Recommendation {
                    operation: op.operation.clone(),
                    kind: RecommendationKind::OptimizeDuration,
                    estimated_savings_pct: 20,
                    priority: 2,
                });
            }
        }

        recommendations.sort_by(|a, b| b.priority.cmp(&a.priority));
        recommendations
    }

    /// Splits the (chronologically ordered) samples in half and compares
    /// mean costs.
    fn trend(samples: &[&CostSample]) -> CostTrend {
        if samples.len() < TREND_MIN_SAMPLES {
            return CostTrend::Stable;
        }

        let mid = samples.len() / 2;
        let mean = |slice: &[&CostSample]| {
            slice.iter().map(|s| s.estimated_cost).sum::<f64>() / slice.len() as f64
        };
        let first = mean(&samples[..mid]);
        let second = mean(&samples[mid..]);

        if first <= f64::EPSILON {
            return CostTrend::Stable;
        }

        let change = (second - first) / first;
        if change > TREND_THRESHOLD {
            CostTrend::Increasing
        } else if change < -TREND_THRESHOLD {
            CostTrend::Decreasing
        } else {
            CostTrend::Stable
        }
    }
}

impl Default for CostLedger {
    fn default() -> Self {
        Self::new(CostConfig::default())
    }
}
