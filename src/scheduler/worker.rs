//! Worker side of the batch protocol.
//!
//! The coordinator never calls into workers; workers drive the batch
//! lifecycle themselves through the shared store:
//!
//! 1. **Claim**: atomically move the head of the task queue to the tail of
//!    the processing queue, take a lease token and write a heartbeat.
//! 2. **Heartbeat**: rotate the lease token by compare-and-swap and refresh
//!    the batch and worker heartbeats. A failed swap means the coordinator
//!    requeued the batch; the worker must stop working on it.
//! 3. **Finish**: release the lease, move the batch to the completed or
//!    failed queue and update counters and metrics.
//!
//! [`WorkerClient`] implements these steps. [`Worker`] runs them in a loop
//! around a caller-supplied [`BatchHandler`], heartbeating while the
//! handler runs.
//!
//! Delivery is at-least-once. A batch claimed while a recovery pass is
//! scanning can be requeued before its first heartbeat lands; handlers must
//! be idempotent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{
    Batch, API_CALLS, COMPLETED_BATCHES, COMPLETED_ITEMS, FAILED_BATCHES, FAILED_ITEMS,
    PENDING_BATCHES, PROCESSED_ITEMS, PROCESSING_BATCHES, RATE_LIMIT_DELAYS,
};
use crate::error::CoordinatorError;
use crate::store::{JobKeys, QueueStore};

/// A batch this worker currently holds.
#[derive(Debug, Clone)]
pub struct ClaimedBatch {
    pub batch: Batch,
    /// The exact queue record, needed to remove it later.
    raw: String,
    lease_token: String,
}

impl ClaimedBatch {
    pub fn batch_id(&self) -> &str {
        &self.batch.batch_id
    }

    pub fn lease_token(&self) -> &str {
        &self.lease_token
    }
}

/// How a batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed,
    Failed,
}

/// Work accounting reported by a handler for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub api_calls: i64,
    pub rate_limit_delays: i64,
}

/// Store client implementing the worker protocol for one job.
#[derive(Clone)]
pub struct WorkerClient {
    store: Arc<dyn QueueStore>,
    keys: JobKeys,
    worker_id: String,
}

impl WorkerClient {
    pub fn new(store: Arc<dyn QueueStore>, keys: JobKeys, worker_id: impl Into<String>) -> Self {
        Self {
            store,
            keys,
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Writes the worker's own liveness heartbeat.
    pub async fn register(&self) -> Result<(), CoordinatorError> {
        let now = self.store.now().await?;
        self.store
            .hash_set(&self.keys.heartbeats, &self.worker_id, &now.to_string())
            .await?;
        Ok(())
    }

    /// Claims the next pending batch, if any.
    ///
    /// # Errors
    ///
    /// A malformed record is left in the processing queue and reported as
    /// `ModelError::MalformedBatch`.
    pub async fn claim(&self) -> Result<Option<ClaimedBatch>, CoordinatorError> {
        let Some(raw) = self
            .store
            .move_head(&self.keys.task_queue, &self.keys.processing_queue)
            .await?
        else {
            return Ok(None);
        };

        let batch = Batch::from_json(&raw)?;
        let now = self.store.now().await?.to_string();
        self.store
            .hash_set(&self.keys.heartbeats, &batch.batch_id, &now)
            .await?;

        let lease_token = Uuid::new_v4().to_string();
        self.store
            .hash_set(&self.keys.leases, &batch.batch_id, &lease_token)
            .await?;

        self.store
            .hash_incr(&self.keys.status, PENDING_BATCHES, -1)
            .await?;
        self.store
            .hash_incr(&self.keys.status, PROCESSING_BATCHES, 1)
            .await?;
        self.store
            .hash_set(&self.keys.heartbeats, &self.worker_id, &now)
            .await?;

        debug!(
            worker_id = %self.worker_id,
            batch_id = %batch.batch_id,
            items = batch.len(),
            "Claimed batch"
        );

        Ok(Some(ClaimedBatch {
            batch,
            raw,
            lease_token,
        }))
    }

    /// Proves the worker is still alive and still owns the batch.
    ///
    /// Returns `false` if the lease was revoked; the batch is back in the
    /// task queue and the caller must abandon it.
    pub async fn heartbeat(&self, claimed: &mut ClaimedBatch) -> Result<bool, CoordinatorError> {
        let next_token = Uuid::new_v4().to_string();
        let renewed = self
            .store
            .hash_compare_and_swap(
                &self.keys.leases,
                &claimed.batch.batch_id,
                &claimed.lease_token,
                Some(&next_token),
            )
            .await?;
        if !renewed {
            warn!(
                worker_id = %self.worker_id,
                batch_id = %claimed.batch.batch_id,
                "Lease revoked, abandoning batch"
            );
            return Ok(false);
        }
        claimed.lease_token = next_token;

        let now = self.store.now().await?.to_string();
        self.store
            .hash_set(&self.keys.heartbeats, &claimed.batch.batch_id, &now)
            .await?;
        self.store
            .hash_set(&self.keys.heartbeats, &self.worker_id, &now)
            .await?;
        Ok(true)
    }

    /// Records a successful batch. Returns `false` if the lease was lost
    /// and the outcome dropped.
    pub async fn complete(
        &self,
        claimed: ClaimedBatch,
        report: BatchReport,
    ) -> Result<bool, CoordinatorError> {
        self.finish(claimed, BatchOutcome::Completed, report).await
    }

    /// Records a failed batch. Returns `false` if the lease was lost and
    /// the outcome dropped.
    pub async fn fail(
        &self,
        claimed: ClaimedBatch,
        report: BatchReport,
    ) -> Result<bool, CoordinatorError> {
        self.finish(claimed, BatchOutcome::Failed, report).await
    }

    async fn finish(
        &self,
        claimed: ClaimedBatch,
        outcome: BatchOutcome,
        report: BatchReport,
    ) -> Result<bool, CoordinatorError> {
        let batch_id = claimed.batch.batch_id.as_str();

        let released = self
            .store
            .hash_compare_and_swap(&self.keys.leases, batch_id, &claimed.lease_token, None)
            .await?;
        if !released {
            warn!(
                worker_id = %self.worker_id,
                batch_id = %batch_id,
                outcome = ?outcome,
                "Lease lost before finish, dropping outcome"
            );
            return Ok(false);
        }

        let removed = self
            .store
            .remove(&self.keys.processing_queue, &claimed.raw)
            .await?;
        if removed == 0 {
            warn!(
                worker_id = %self.worker_id,
                batch_id = %batch_id,
                "Batch no longer in processing queue, dropping outcome"
            );
            return Ok(false);
        }

        let (queue, batch_counter, item_counter) = match outcome {
            BatchOutcome::Completed => (
                &self.keys.completed_queue,
                COMPLETED_BATCHES,
                COMPLETED_ITEMS,
            ),
            BatchOutcome::Failed => (&self.keys.failed_queue, FAILED_BATCHES, FAILED_ITEMS),
        };
        self.store.push(queue, &claimed.raw).await?;

        self.store
            .hash_incr(&self.keys.status, PROCESSING_BATCHES, -1)
            .await?;
        self.store
            .hash_incr(&self.keys.status, batch_counter, 1)
            .await?;

        let items = claimed.batch.len() as i64;
        if outcome == BatchOutcome::Completed {
            self.store
                .hash_incr(&self.keys.metrics, PROCESSED_ITEMS, items)
                .await?;
        }
        self.store
            .hash_incr(&self.keys.metrics, item_counter, items)
            .await?;
        if report.api_calls != 0 {
            self.store
                .hash_incr(&self.keys.metrics, API_CALLS, report.api_calls)
                .await?;
        }
        if report.rate_limit_delays != 0 {
            self.store
                .hash_incr(&self.keys.metrics, RATE_LIMIT_DELAYS, report.rate_limit_delays)
                .await?;
        }

        self.store
            .hash_delete(&self.keys.heartbeats, batch_id)
            .await?;

        Ok(true)
    }
}

/// The unit of work a worker performs on a batch.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Processes every item of `batch`. An error marks the batch failed.
    async fn process(&self, batch: &Batch) -> anyhow::Result<BatchReport>;
}

/// Counters for one worker loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerStats {
    pub batches_completed: u64,
    pub batches_failed: u64,
    pub batches_abandoned: u64,
    pub average_batch_duration: Duration,
}

impl WorkerStats {
    pub fn total_processed(&self) -> u64 {
        self.batches_completed + self.batches_failed
    }
}

#[derive(Default)]
struct SharedWorkerStats {
    completed: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedWorkerStats {
    fn record(&self, outcome: BatchOutcome, duration: Duration) {
        let counter = match outcome {
            BatchOutcome::Completed => &self.completed,
            BatchOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> WorkerStats {
        let completed = self.completed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let total = completed + failed;
        let average_batch_duration = if total > 0 {
            Duration::from_millis(self.total_duration_ms.load(Ordering::SeqCst) / total)
        } else {
            Duration::ZERO
        };

        WorkerStats {
            batches_completed: completed,
            batches_failed: failed,
            batches_abandoned: self.abandoned.load(Ordering::SeqCst),
            average_batch_duration,
        }
    }
}

/// Shortest heartbeat interval a worker accepts; `tokio::time::interval`
/// rejects a zero period.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// Claims and processes batches until shutdown or an idle limit.
pub struct Worker {
    client: WorkerClient,
    handler: Arc<dyn BatchHandler>,
    shutdown_rx: broadcast::Receiver<()>,
    /// Delay between claim attempts when the task queue is empty.
    poll_interval: Duration,
    /// Delay between heartbeats while a batch is processed.
    heartbeat_interval: Duration,
    /// Stop after this many consecutive empty polls; `None` runs until shutdown.
    max_idle_polls: Option<u32>,
    stats: SharedWorkerStats,
}

impl Worker {
    pub fn new(
        client: WorkerClient,
        handler: Arc<dyn BatchHandler>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            client,
            handler,
            shutdown_rx,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            max_idle_polls: None,
            stats: SharedWorkerStats::default(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the heartbeat interval; keep it well below the stall threshold.
    ///
    /// Intervals shorter than one millisecond are raised to one millisecond.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_HEARTBEAT_INTERVAL);
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn with_max_idle_polls(mut self, polls: u32) -> Self {
        self.max_idle_polls = Some(polls);
        self
    }

    pub fn id(&self) -> &str {
        self.client.worker_id()
    }

    /// Main worker loop. Returns the worker's statistics when it stops.
    ///
    /// Store errors are logged and retried after `poll_interval`; the loop
    /// only ends on shutdown or after `max_idle_polls` empty polls.
    pub async fn run(mut self) -> WorkerStats {
        info!(worker_id = %self.id(), "Worker started");
        let mut idle_polls = 0u32;

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id(), "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            if let Err(e) = self.client.register().await {
                warn!(worker_id = %self.id(), error = %e, "Failed to write worker heartbeat");
            }

            match self.client.claim().await {
                Ok(Some(claimed)) => {
                    idle_polls = 0;
                    self.process(claimed).await;
                }
                Ok(None) => {
                    idle_polls += 1;
                    if self.max_idle_polls.is_some_and(|max| idle_polls >= max) {
                        debug!(worker_id = %self.id(), "Idle limit reached");
                        break;
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => {
                    error!(worker_id = %self.id(), error = %e, "Failed to claim batch");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        let stats = self.stats.snapshot();
        info!(
            worker_id = %self.id(),
            completed = stats.batches_completed,
            failed = stats.batches_failed,
            abandoned = stats.batches_abandoned,
            "Worker stopped"
        );
        stats
    }

    async fn process(&self, mut claimed: ClaimedBatch) {
        let start = Instant::now();
        let batch = claimed.batch.clone();
        let work = self.handler.process(&batch);
        tokio::pin!(work);

        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The claim already wrote a heartbeat.
        ticker.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut work => break result,
                _ = ticker.tick() => {
                    match self.client.heartbeat(&mut claimed).await {
                        Ok(true) => {}
                        Ok(false) => {
                            self.stats.record_abandoned();
                            return;
                        }
                        Err(e) => {
                            warn!(
                                worker_id = %self.id(),
                                batch_id = %claimed.batch_id(),
                                error = %e,
                                "Heartbeat failed"
                            );
                        }
                    }
                }
            }
        };

        let (outcome, report) = match result {
            Ok(report) => (BatchOutcome::Completed, report),
            Err(e) => {
                warn!(
                    worker_id = %self.id(),
                    batch_id = %claimed.batch_id(),
                    error = %e,
                    "Batch handler failed"
                );
                (BatchOutcome::Failed, BatchReport::default())
            }
        };

        let finished = match outcome {
            BatchOutcome::Completed => self.client.complete(claimed, report).await,
            BatchOutcome::Failed => self.client.fail(claimed, report).await,
        };

        match finished {
            Ok(true) => self.stats.record(outcome, start.elapsed()),
            Ok(false) => self.stats.record_abandoned(),
            Err(e) => {
                // The batch stays in the processing queue; stall recovery
                // returns it to the task queue.
                error!(worker_id = %self.id(), error = %e, "Failed to record batch outcome");
            }
        }
    }
}
