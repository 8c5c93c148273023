//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by the coordinator and
//! provides functions for initializing, registering, and exporting them.
//! Every per-job series carries a `job_id` label.

use prometheus::{
    CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all coordinator metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Length of each batch queue, labeled by job and queue.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Batch status counters, labeled by job and state.
pub static BATCHES: OnceLock<GaugeVec> = OnceLock::new();

/// Item-level counters, labeled by job and state.
pub static ITEMS: OnceLock<GaugeVec> = OnceLock::new();

/// Workers with a recent heartbeat, labeled by job.
pub static ACTIVE_WORKERS: OnceLock<GaugeVec> = OnceLock::new();

/// Completed batches as a percentage of the total, labeled by job.
pub static PROGRESS_PERCENT: OnceLock<GaugeVec> = OnceLock::new();

/// Processed items per minute since the job started, labeled by job.
pub static THROUGHPUT: OnceLock<GaugeVec> = OnceLock::new();

/// Estimated seconds to completion, labeled by job. Absent while unknown.
pub static ETA_SECONDS: OnceLock<GaugeVec> = OnceLock::new();

/// Batches requeued by recovery, labeled by job and kind (failed/stalled).
pub static RECOVERED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Duration of one monitor poll in seconds.
pub static POLL_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls build a fresh registry but leave the
/// statics pointing at the first one.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("batch_coordinator_queue_depth", "Number of batches in each queue"),
        &["job_id", "queue"],
    )?;

    let batches = GaugeVec::new(
        Opts::new("batch_coordinator_batches", "Batch status counters"),
        &["job_id", "state"],
    )?;

    let items = GaugeVec::new(
        Opts::new("batch_coordinator_items", "Item-level counters"),
        &["job_id", "state"],
    )?;

    // Progress metrics
    let active_workers = GaugeVec::new(
        Opts::new(
            "batch_coordinator_active_workers",
            "Workers with a recent heartbeat",
        ),
        &["job_id"],
    )?;

    let progress_percent = GaugeVec::new(
        Opts::new(
            "batch_coordinator_progress_percent",
            "Completed batches as a percentage of all batches",
        ),
        &["job_id"],
    )?;

    let throughput = GaugeVec::new(
        Opts::new(
            "batch_coordinator_throughput_items_per_minute",
            "Processed items per minute since the job started",
        ),
        &["job_id"],
    )?;

    let eta_seconds = GaugeVec::new(
        Opts::new(
            "batch_coordinator_eta_seconds",
            "Estimated seconds until every item is processed",
        ),
        &["job_id"],
    )?;

    // Recovery metrics
    let recovered_total = CounterVec::new(
        Opts::new(
            "batch_coordinator_recovered_batches_total",
            "Batches requeued by recovery",
        ),
        &["job_id", "kind"],
    )?;

    let poll_duration = Histogram::with_opts(
        HistogramOpts::new(
            "batch_coordinator_poll_duration_seconds",
            "Duration of one monitor poll in seconds",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
    )?;

    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(batches.clone()))?;
    registry.register(Box::new(items.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(progress_percent.clone()))?;
    registry.register(Box::new(throughput.clone()))?;
    registry.register(Box::new(eta_seconds.clone()))?;
    registry.register(Box::new(recovered_total.clone()))?;
    registry.register(Box::new(poll_duration.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = BATCHES.set(batches);
    let _ = ITEMS.set(items);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = PROGRESS_PERCENT.set(progress_percent);
    let _ = THROUGHPUT.set(throughput);
    let _ = ETA_SECONDS.set(eta_seconds);
    let _ = RECOVERED_TOTAL.set(recovered_total);
    let _ = POLL_DURATION.set(poll_duration);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead if the registry has not been initialized
/// or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Writes the text exposition to `path` for a node_exporter textfile
/// collector. The file is replaced atomically through a sibling temp file.
pub fn write_metrics_file(path: &std::path::Path) -> std::io::Result<()> {
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, export_metrics())?;
    std::fs::rename(&tmp, path)
}
