//! High-level recording interface over the raw Prometheus metrics.
//!
//! The `MetricsCollector` is bound to one job and translates coordinator
//! observations (progress snapshots, recovery passes, poll timings) into
//! labeled metric updates.

use super::prometheus::{
    ACTIVE_WORKERS, BATCHES, ETA_SECONDS, ITEMS, POLL_DURATION, PROGRESS_PERCENT, QUEUE_DEPTH,
    RECOVERED_TOTAL, THROUGHPUT,
};
use crate::scheduler::monitor::ProgressSnapshot;

/// Which recovery path requeued a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKind {
    Failed,
    Stalled,
}

impl RecoveryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryKind::Failed => "failed",
            RecoveryKind::Stalled => "stalled",
        }
    }
}

/// Metrics collector for one job.
///
/// Recording is a no-op until `init_metrics()` has run, so library users
/// that never export metrics pay nothing.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    job_id: String,
}

impl MetricsCollector {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Publishes every gauge derived from a progress snapshot.
    pub fn record_progress(&self, snapshot: &ProgressSnapshot) {
        let job = self.job_id.as_str();

        if let Some(depth) = QUEUE_DEPTH.get() {
            let d = &snapshot.depths;
            for (queue, len) in [
                ("task_queue", d.pending),
                ("processing_queue", d.processing),
                ("completed_queue", d.completed),
                ("failed_queue", d.failed),
            ] {
                depth.with_label_values(&[job, queue]).set(len as f64);
            }
        }

        if let Some(batches) = BATCHES.get() {
            let c = &snapshot.counters;
            for (state, value) in [
                ("total", c.total),
                ("pending", c.pending),
                ("processing", c.processing),
                ("completed", c.completed),
                ("failed", c.failed),
            ] {
                batches.with_label_values(&[job, state]).set(value as f64);
            }
        }

        if let Some(items) = ITEMS.get() {
            let m = &snapshot.metrics;
            for (state, value) in [
                ("total", m.total_items),
                ("processed", m.processed_items),
                ("completed", m.completed_items),
                ("failed", m.failed_items),
            ] {
                items.with_label_values(&[job, state]).set(value as f64);
            }
        }

        if let Some(active) = ACTIVE_WORKERS.get() {
            active
                .with_label_values(&[job])
                .set(snapshot.active_workers as f64);
        }

        if let Some(progress) = PROGRESS_PERCENT.get() {
            progress
                .with_label_values(&[job])
                .set(snapshot.progress_percent);
        }

        if let Some(throughput) = THROUGHPUT.get() {
            throughput
                .with_label_values(&[job])
                .set(snapshot.throughput_per_minute);
        }

        if let Some(eta) = ETA_SECONDS.get() {
            match snapshot.eta_seconds {
                Some(secs) => eta.with_label_values(&[job]).set(secs),
                None => {
                    let _ = eta.remove_label_values(&[job]);
                }
            }
        }

        tracing::trace!(job_id = %job, "Recorded progress metrics");
    }

    /// Counts batches requeued by one recovery pass.
    pub fn record_recovery(&self, kind: RecoveryKind, recovered: usize) {
        if recovered == 0 {
            return;
        }
        if let Some(total) = RECOVERED_TOTAL.get() {
            total
                .with_label_values(&[self.job_id.as_str(), kind.as_str()])
                .inc_by(recovered as f64);
        }
    }

    /// Observes how long one monitor poll took.
    pub fn observe_poll(&self, duration_secs: f64) {
        if let Some(poll) = POLL_DURATION.get() {
            poll.observe(duration_secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::prometheus::{export_metrics, init_metrics};
    use crate::scheduler::job::{JobMetrics, StatusCounters};
    use crate::scheduler::recovery::QueueDepths;

    fn snapshot(job_id: &str) -> ProgressSnapshot {
        ProgressSnapshot {
            job_id: job_id.to_string(),
            counters: StatusCounters {
                total: 4,
                pending: 1,
                processing: 1,
                completed: 2,
                failed: 0,
            },
            metrics: JobMetrics::seed(40, 0.0),
            depths: QueueDepths {
                pending: 1,
                processing: 1,
                completed: 2,
                failed: 0,
            },
            active_workers: 3,
            progress_percent: 50.0,
            throughput_per_minute: 12.0,
            eta_seconds: None,
            elapsed_seconds: 60.0,
        }
    }

    #[test]
    fn test_recovery_kind_labels() {
        assert_eq!(RecoveryKind::Failed.as_str(), "failed");
        assert_eq!(RecoveryKind::Stalled.as_str(), "stalled");
    }

    #[test]
    fn test_record_progress_sets_gauges() {
        let _ = init_metrics();
        let collector = MetricsCollector::new("collector-test");

        collector.record_progress(&snapshot("collector-test"));
        collector.record_recovery(RecoveryKind::Stalled, 2);
        collector.observe_poll(0.01);

        if let Some(active) = ACTIVE_WORKERS.get() {
            let value = active.with_label_values(&["collector-test"]).get();
            assert!((value - 3.0).abs() < f64::EPSILON);
        }
        if let Some(total) = RECOVERED_TOTAL.get() {
            let value = total
                .with_label_values(&["collector-test", "stalled"])
                .get();
            assert!(value >= 2.0);
        }

        let output = export_metrics();
        assert!(output.contains("batch_coordinator_progress_percent"));
    }

    #[test]
    fn test_recording_without_init_is_noop() {
        let collector = MetricsCollector::new("noop");
        collector.record_recovery(RecoveryKind::Failed, 0);
        assert_eq!(collector.job_id(), "noop");
    }
}
