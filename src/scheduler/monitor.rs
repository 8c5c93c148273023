//! Progress monitoring loop.
//!
//! The monitor polls the job's counters and metrics, derives progress,
//! throughput, ETA and the number of live workers, publishes them as log
//! events and Prometheus gauges, runs recovery periodically and stops once
//! every batch has completed.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::config::CoordinatorConfig;
use super::job::{JobConfig, JobMetrics, JobStatus, StatusCounters};
use super::lease::CoordinatorLease;
use super::recovery::{QueueDepths, RecoveryEngine};
use crate::error::CoordinatorError;
use crate::metrics::{write_metrics_file, MetricsCollector, RecoveryKind};
use crate::store::{JobKeys, QueueStore};

/// Timing knobs of the monitor loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub stall_threshold: Duration,
    pub recovery_interval: Duration,
    pub liveness_window: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from(&CoordinatorConfig::default())
    }
}

impl From<&CoordinatorConfig> for MonitorSettings {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            stall_threshold: config.stall_threshold,
            recovery_interval: config.recovery_interval,
            liveness_window: config.liveness_window,
        }
    }
}

/// Returns whether a heartbeat field names a worker rather than a batch.
pub fn is_worker_field(field: &str) -> bool {
    !field.contains(":batch:") && !field.starts_with("batch:")
}

/// Counts workers whose heartbeat is younger than `window`.
pub fn count_active_workers(
    heartbeats: &HashMap<String, String>,
    now: f64,
    window: Duration,
) -> usize {
    heartbeats
        .iter()
        .filter(|(field, _)| is_worker_field(field))
        .filter_map(|(_, raw)| raw.trim().parse::<f64>().ok())
        .filter(|ts| now - ts < window.as_secs_f64())
        .count()
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Derived view of a job at one poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub job_id: String,
    pub counters: StatusCounters,
    pub metrics: JobMetrics,
    pub depths: QueueDepths,
    pub active_workers: usize,
    pub progress_percent: f64,
    /// Processed items per minute since `start_time`.
    pub throughput_per_minute: f64,
    /// `None` while throughput is zero.
    pub eta_seconds: Option<f64>,
    pub elapsed_seconds: f64,
}

impl ProgressSnapshot {
    /// Derives progress figures from raw store state read at `now`.
    pub fn compute(
        job_id: &str,
        counters: StatusCounters,
        metrics: JobMetrics,
        depths: QueueDepths,
        heartbeats: &HashMap<String, String>,
        now: f64,
        liveness_window: Duration,
    ) -> Self {
        let elapsed_seconds = (now - metrics.start_time).max(0.0);

        let throughput_per_minute = if elapsed_seconds >= 1.0 {
            metrics.processed_items as f64 / (elapsed_seconds / 60.0)
        } else {
            0.0
        };

        let eta_seconds = if throughput_per_minute > 0.0 {
            Some(metrics.remaining_items() as f64 / throughput_per_minute * 60.0)
        } else {
            None
        };

        Self {
            job_id: job_id.to_string(),
            counters,
            metrics,
            depths,
            active_workers: count_active_workers(heartbeats, now, liveness_window),
            progress_percent: counters.progress_percent(),
            throughput_per_minute,
            eta_seconds,
            elapsed_seconds,
        }
    }

    pub fn eta(&self) -> Option<Duration> {
        self.eta_seconds
            .filter(|secs| secs.is_finite())
            .map(Duration::from_secs_f64)
    }

    pub fn is_complete(&self) -> bool {
        self.counters.is_complete()
    }
}

/// Result of a single poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Counters or metrics not seeded yet.
    Waiting,
    InProgress(ProgressSnapshot),
    Completed(ProgressSnapshot),
}

/// Why the monitor loop returned.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorExit {
    Completed(ProgressSnapshot),
    Interrupted,
}

/// Watches one job until it completes.
pub struct ProgressMonitor {
    store: Arc<dyn QueueStore>,
    keys: JobKeys,
    recovery: RecoveryEngine,
    settings: MonitorSettings,
    collector: MetricsCollector,
    lease: Option<CoordinatorLease>,
    metrics_file: Option<PathBuf>,
    last_recovery: Instant,
    drift_polls: u32,
}

impl ProgressMonitor {
    pub fn new(store: Arc<dyn QueueStore>, keys: JobKeys, settings: MonitorSettings) -> Self {
        let recovery = RecoveryEngine::new(store.clone(), keys.clone());
        let collector = MetricsCollector::new(keys.job_id());
        Self {
            store,
            keys,
            recovery,
            settings,
            collector,
            lease: None,
            metrics_file: None,
            last_recovery: Instant::now(),
            drift_polls: 0,
        }
    }

    /// Renews `lease` on every poll and releases it when the loop ends.
    pub fn with_lease(mut self, lease: CoordinatorLease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Writes the Prometheus text exposition to `path` after every poll.
    pub fn with_metrics_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.metrics_file = Some(path.into());
        self
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Reads the job's current state without side effects.
    ///
    /// Returns `None` while counters or metrics are not seeded.
    pub async fn snapshot(&self) -> Result<Option<ProgressSnapshot>, CoordinatorError> {
        let status = self.store.hash_get_all(&self.keys.status).await?;
        let metrics = self.store.hash_get_all(&self.keys.metrics).await?;
        if status.is_empty() || metrics.is_empty() {
            return Ok(None);
        }

        let counters = StatusCounters::from_hash(&status)?;
        let metrics = JobMetrics::from_hash(&metrics)?;
        let heartbeats = self.store.hash_get_all(&self.keys.heartbeats).await?;
        let depths = QueueDepths::read(self.store.as_ref(), &self.keys).await?;
        let now = self.store.now().await?;

        Ok(Some(ProgressSnapshot::compute(
            self.keys.job_id(),
            counters,
            metrics,
            depths,
            &heartbeats,
            now,
            self.settings.liveness_window,
        )))
    }

    /// Runs one iteration of the monitor loop, without sleeping.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, CoordinatorError> {
        let started = Instant::now();

        let Some(snapshot) = self.snapshot().await? else {
            warn!(job_id = %self.keys.job_id(), "Job counters not found, waiting");
            return Ok(PollOutcome::Waiting);
        };

        self.check_drift(&snapshot);

        info!(
            job_id = %snapshot.job_id,
            progress_percent = round1(snapshot.progress_percent),
            completed = snapshot.counters.completed,
            total = snapshot.counters.total,
            pending = snapshot.counters.pending,
            processing = snapshot.counters.processing,
            failed = snapshot.counters.failed,
            processed_items = snapshot.metrics.processed_items,
            throughput_per_min = round1(snapshot.throughput_per_minute),
            eta_minutes = ?snapshot.eta_seconds.map(|s| (s / 60.0).round()),
            active_workers = snapshot.active_workers,
            "Job progress"
        );

        self.collector.record_progress(&snapshot);
        self.export_metrics_file();

        if snapshot.is_complete() {
            self.mark_completed().await?;
            info!(
                job_id = %snapshot.job_id,
                total_items = snapshot.metrics.total_items,
                completed_items = snapshot.metrics.completed_items,
                failed_items = snapshot.metrics.failed_items,
                api_calls = snapshot.metrics.api_calls,
                rate_limit_delays = snapshot.metrics.rate_limit_delays,
                elapsed_secs = snapshot.elapsed_seconds.round(),
                "Job completed"
            );
            self.collector.observe_poll(started.elapsed().as_secs_f64());
            return Ok(PollOutcome::Completed(snapshot));
        }

        if self.last_recovery.elapsed() >= self.settings.recovery_interval {
            self.run_recovery().await?;
            self.last_recovery = Instant::now();
        }

        self.collector.observe_poll(started.elapsed().as_secs_f64());
        Ok(PollOutcome::InProgress(snapshot))
    }

    /// Runs both recovery passes once and returns `(failed, stalled)` counts.
    pub async fn run_recovery(&self) -> Result<(usize, usize), CoordinatorError> {
        let failed = self.recovery.recover_failed_tasks().await?;
        let stalled = self
            .recovery
            .recover_stalled_tasks(self.settings.stall_threshold)
            .await?;

        self.collector.record_recovery(RecoveryKind::Failed, failed);
        self.collector.record_recovery(RecoveryKind::Stalled, stalled);

        if failed > 0 || stalled > 0 {
            info!(
                job_id = %self.keys.job_id(),
                failed = failed,
                stalled = stalled,
                "Recovery pass requeued batches"
            );
        } else {
            debug!(job_id = %self.keys.job_id(), "Recovery pass found nothing to requeue");
        }

        Ok((failed, stalled))
    }

    /// Marks the stored job completed. Returns `false` if it already was.
    pub async fn mark_completed(&self) -> Result<bool, CoordinatorError> {
        let job_id = self.keys.job_id();
        let raw = self
            .store
            .get(&self.keys.config)
            .await?
            .ok_or_else(|| CoordinatorError::JobNotFound(job_id.to_string()))?;
        let mut config = JobConfig::from_json(job_id, &raw)?;

        if config.status.is_terminal() {
            debug!(job_id = %job_id, "Job already marked completed");
            return Ok(false);
        }

        config.transition(JobStatus::Completed)?;
        self.store.set(&self.keys.config, &config.to_json()?).await?;
        Ok(true)
    }

    /// Polls until the job completes or `shutdown` resolves.
    ///
    /// Shutdown leaves job state untouched; only the coordinator lease, if
    /// held, is released.
    ///
    /// # Errors
    ///
    /// Store failures that outlast the retry policy, malformed stored
    /// records and a lost coordinator lease end the loop.
    pub async fn run<F>(mut self, shutdown: F) -> Result<MonitorExit, CoordinatorError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            job_id = %self.keys.job_id(),
            poll_interval_secs = self.settings.poll_interval.as_secs_f64(),
            "Monitoring job"
        );

        loop {
            let outcome = match self.poll_once().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.release_lease().await;
                    return Err(e);
                }
            };
            if let PollOutcome::Completed(snapshot) = outcome {
                self.release_lease().await;
                return Ok(MonitorExit::Completed(snapshot));
            }

            if let Some(lease) = &self.lease {
                lease.renew().await?;
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!(job_id = %self.keys.job_id(), "Shutdown requested, leaving job state as is");
                    self.release_lease().await;
                    return Ok(MonitorExit::Interrupted);
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }

    async fn release_lease(&mut self) {
        if let Some(lease) = self.lease.take() {
            if let Err(e) = lease.release().await {
                warn!(
                    job_id = %self.keys.job_id(),
                    error = %e,
                    "Failed to release coordinator lease"
                );
            }
        }
    }

    fn check_drift(&mut self, snapshot: &ProgressSnapshot) {
        // Workers update queues and counters in separate steps, so a single
        // mismatched poll is expected.
        if snapshot.depths.drifts_from(&snapshot.counters) {
            self.drift_polls += 1;
            if self.drift_polls >= 2 {
                warn!(
                    job_id = %snapshot.job_id,
                    counters = ?snapshot.counters,
                    depths = ?snapshot.depths,
                    polls = self.drift_polls,
                    "Status counters disagree with queue depths; run reconcile to repair"
                );
            }
        } else {
            self.drift_polls = 0;
        }
    }

    fn export_metrics_file(&self) {
        if let Some(path) = &self.metrics_file {
            if let Err(e) = write_metrics_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to write metrics file");
            }
        }
    }
}
