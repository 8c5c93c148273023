//! Prometheus-based monitoring for the coordinator.
//!
//! # Example
//!
//! ```ignore
//! use batch_coordinator::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! // One collector per coordinated job
//! let collector = MetricsCollector::new("20240101120000");
//! collector.record_recovery(RecoveryKind::Stalled, 2);
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, RecoveryKind};
pub use prometheus::{export_metrics, init_metrics, write_metrics_file};

pub use prometheus::{
    ACTIVE_WORKERS, BATCHES, ETA_SECONDS, ITEMS, POLL_DURATION, PROGRESS_PERCENT, QUEUE_DEPTH,
    RECOVERED_TOTAL, REGISTRY, THROUGHPUT,
};
