//! Observability module
//!
//! Metrics are recorded through the `metrics` facade; the exporter is chosen by
//! the process entry point.

pub mod metrics_collector;

pub use metrics_collector::MetricsCollector;
