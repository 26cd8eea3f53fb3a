//! # cz-observability
//!
//! Logging and metrics infrastructure for the CuisineZen backend.
//!
//! Call [`init_logging`] once at process start, then
//! [`register_governance_metrics`] so every metric the governance layer
//! emits carries a description for the scrape endpoint.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, init_logging_with_config, LoggingConfig};
pub use metrics::register_governance_metrics;
