//! Per-operation cost accounting.
//!
//! Records how long operations run and how much memory they are allocated,
//! derives an estimated dollar cost, and aggregates the result into reports
//! and tuning recommendations. Everything here is advisory: the ledger
//! informs whoever tunes the rate-limit policies and cache TTLs, and has no
//! authority over them.

mod ledger;
mod types;

pub use ledger::{CostConfig, CostLedger};
pub use types::{
    CostReport, CostSample, CostTrend, OperationCostReport, Recommendation, RecommendationKind,
};
