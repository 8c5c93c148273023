//! Recovery of lost work.
//!
//! Two kinds of batches need rescuing:
//!
//! - **Failed**: a worker reported failure and pushed the batch to the
//!   failed queue. These are drained back into the task queue.
//! - **Stalled**: a batch sits in the processing queue but its heartbeat is
//!   missing or older than the stall threshold, meaning the worker crashed
//!   or hung. These are moved back to the task queue.
//!
//! Delivery is at-least-once: a slow worker may still finish a batch after
//! it was requeued, so workers must be idempotent.
//!
//! # Leases
//!
//! A worker that holds a lease token for its batch rotates the token on
//! every heartbeat. Before moving a stalled batch the engine deletes the
//! lease with a compare-and-swap against the token it read during the scan;
//! if the swap fails the worker is alive and the batch is left alone.
//! Batches without a lease fall back to the plain remove-then-push path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::job::{
    Batch, StatusCounters, FAILED_BATCHES, PENDING_BATCHES, PROCESSING_BATCHES,
    RECOVERED_FAILED, RECOVERED_STALLED,
};
use crate::error::{CoordinatorError, StoreError};
use crate::store::{JobKeys, QueueStore};

/// Current length of each batch queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueDepths {
    /// Reads the four queue lengths of a job.
    pub async fn read(store: &dyn QueueStore, keys: &JobKeys) -> Result<Self, StoreError> {
        Ok(Self {
            pending: store.len(&keys.task_queue).await?,
            processing: store.len(&keys.processing_queue).await?,
            completed: store.len(&keys.completed_queue).await?,
            failed: store.len(&keys.failed_queue).await?,
        })
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }

    /// Returns whether the maintained counters disagree with the queues.
    pub fn drifts_from(&self, counters: &StatusCounters) -> bool {
        counters.pending != self.pending as i64
            || counters.processing != self.processing as i64
            || counters.completed != self.completed as i64
            || counters.failed != self.failed as i64
    }
}

/// Outcome of a counter reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reconciliation {
    pub before: StatusCounters,
    pub after: StatusCounters,
}

impl Reconciliation {
    pub fn changed(&self) -> bool {
        self.before != self.after
    }
}

/// Returns the newest heartbeat recorded for `batch_id`.
///
/// Both the plain `batch_id` field and the older `batch:{batch_id}` field
/// are consulted, both in the job's `heartbeats` hash. Unparseable values
/// are ignored.
pub fn batch_heartbeat(heartbeats: &HashMap<String, String>, batch_id: &str) -> Option<f64> {
    let legacy = format!("batch:{}", batch_id);
    [batch_id, legacy.as_str()]
        .iter()
        .filter_map(|field| heartbeats.get(*field))
        .filter_map(|raw| raw.trim().parse::<f64>().ok())
        .fold(None, |newest: Option<f64>, ts| {
            Some(newest.map_or(ts, |n| n.max(ts)))
        })
}

/// Returns whether a batch last seen at `last_seen` counts as stalled at `now`.
pub fn is_stalled(last_seen: Option<f64>, now: f64, threshold: Duration) -> bool {
    match last_seen {
        Some(ts) => now - ts > threshold.as_secs_f64(),
        None => true,
    }
}

/// Requeues failed and stalled batches of one job.
#[derive(Clone)]
pub struct RecoveryEngine {
    store: Arc<dyn QueueStore>,
    keys: JobKeys,
}

impl RecoveryEngine {
    pub fn new(store: Arc<dyn QueueStore>, keys: JobKeys) -> Self {
        Self { store, keys }
    }

    pub fn keys(&self) -> &JobKeys {
        &self.keys
    }

    /// Moves every batch in the failed queue back to the task queue.
    ///
    /// Each batch moves with a single atomic `move_head`, so a store failure
    /// leaves it in one of the two queues. Counters are only touched when at
    /// least one batch moved, and moves made before an error are still
    /// counted.
    pub async fn recover_failed_tasks(&self) -> Result<usize, CoordinatorError> {
        let mut recovered = 0usize;

        let drained = loop {
            match self
                .store
                .move_head(&self.keys.failed_queue, &self.keys.task_queue)
                .await
            {
                Ok(Some(_)) => recovered += 1,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if recovered > 0 {
            let n = recovered as i64;
            self.store
                .hash_incr(&self.keys.status, PENDING_BATCHES, n)
                .await?;
            self.store
                .hash_incr(&self.keys.status, FAILED_BATCHES, -n)
                .await?;
            self.store
                .hash_incr(&self.keys.metrics, RECOVERED_FAILED, n)
                .await?;

            info!(
                job_id = %self.keys.job_id(),
                recovered = recovered,
                "Requeued failed batches"
            );
        }

        drained?;
        Ok(recovered)
    }

    /// Moves batches whose heartbeat is missing or older than `threshold`
    /// back to the task queue.
    ///
    /// Returns the number of batches requeued.
    ///
    /// # Errors
    ///
    /// A processing-queue record that is not a valid batch fails the whole
    /// pass before anything is moved.
    pub async fn recover_stalled_tasks(
        &self,
        threshold: Duration,
    ) -> Result<usize, CoordinatorError> {
        let records = self.store.range(&self.keys.processing_queue).await?;
        if records.is_empty() {
            return Ok(0);
        }

        let batches = records
            .into_iter()
            .map(|raw| Batch::from_json(&raw).map(|batch| (batch, raw)))
            .collect::<Result<Vec<_>, _>>()?;

        // Leases are read before heartbeats: a worker that heartbeats in
        // between has rotated its token, so the swap below fails.
        let leases = self.store.hash_get_all(&self.keys.leases).await?;
        let heartbeats = self.store.hash_get_all(&self.keys.heartbeats).await?;
        let now = self.store.now().await?;

        let mut recovered = 0usize;
        let mut outcome = Ok(());

        for (batch, raw) in batches {
            let last_seen = batch_heartbeat(&heartbeats, &batch.batch_id);
            if !is_stalled(last_seen, now, threshold) {
                continue;
            }

            match self.requeue_stalled(&batch, &raw, leases.get(&batch.batch_id)).await {
                Ok(true) => {
                    warn!(
                        job_id = %self.keys.job_id(),
                        batch_id = %batch.batch_id,
                        last_seen = ?last_seen,
                        "Requeued stalled batch"
                    );
                    recovered += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        if recovered > 0 {
            let n = recovered as i64;
            self.store
                .hash_incr(&self.keys.status, PENDING_BATCHES, n)
                .await?;
            self.store
                .hash_incr(&self.keys.status, PROCESSING_BATCHES, -n)
                .await?;
            self.store
                .hash_incr(&self.keys.metrics, RECOVERED_STALLED, n)
                .await?;
        }

        outcome?;
        Ok(recovered)
    }

    /// Moves one stalled batch back to the task queue. Returns `false` if
    /// its worker turned out to be alive or already finished it.
    async fn requeue_stalled(
        &self,
        batch: &Batch,
        raw: &str,
        lease: Option<&String>,
    ) -> Result<bool, CoordinatorError> {
        if let Some(token) = lease {
            let revoked = self
                .store
                .hash_compare_and_swap(&self.keys.leases, &batch.batch_id, token, None)
                .await?;
            if !revoked {
                debug!(
                    batch_id = %batch.batch_id,
                    "Lease renewed since scan, leaving batch with its worker"
                );
                return Ok(false);
            }
        }

        let removed = self.store.remove(&self.keys.processing_queue, raw).await?;
        if removed == 0 {
            // Finished by its worker after the snapshot.
            debug!(batch_id = %batch.batch_id, "Batch left processing queue during scan");
            return Ok(false);
        }

        // Heartbeats go before the push: once the batch is visible in the
        // task queue, a new owner may already be writing its own.
        self.store
            .hash_delete(&self.keys.heartbeats, &batch.batch_id)
            .await?;
        self.store
            .hash_delete(&self.keys.heartbeats, &format!("batch:{}", batch.batch_id))
            .await?;
        self.store.push(&self.keys.task_queue, raw).await?;

        Ok(true)
    }

    /// Rewrites the bucket counters from the queue lengths.
    ///
    /// `total_batches` is kept; a mismatch between it and the queues means
    /// batches were lost and is logged.
    pub async fn reconcile_counters(&self) -> Result<Reconciliation, CoordinatorError> {
        let before =
            StatusCounters::from_hash(&self.store.hash_get_all(&self.keys.status).await?)?;
        let depths = QueueDepths::read(self.store.as_ref(), &self.keys).await?;

        let after = StatusCounters {
            total: before.total,
            pending: depths.pending as i64,
            processing: depths.processing as i64,
            completed: depths.completed as i64,
            failed: depths.failed as i64,
        };

        if !after.is_consistent() {
            warn!(
                job_id = %self.keys.job_id(),
                total_batches = after.total,
                queued = depths.total(),
                "Queues do not account for every batch"
            );
        }

        let reconciliation = Reconciliation { before, after };
        if reconciliation.changed() {
            self.store
                .hash_set_many(&self.keys.status, &after.to_fields())
                .await?;
            info!(
                job_id = %self.keys.job_id(),
                before = ?before,
                after = ?after,
                "Reconciled status counters"
            );
        }

        Ok(reconciliation)
    }
}
