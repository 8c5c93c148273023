//! Per-job key layout in the shared store.
//!
//! Only workers that speak this crate's protocol can share a job: they must
//! write heartbeats to `heartbeats:{job}` and leases to `leases:{job}`. A
//! worker heartbeating anywhere else makes all of its batches look stalled.

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "backfill";

/// Names of every store key that belongs to one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobKeys {
    job_id: String,
    /// JSON job config blob.
    pub config: String,
    /// Hash of batch status counters.
    pub status: String,
    /// Hash of item-level metrics.
    pub metrics: String,
    /// Batches waiting for a worker.
    pub task_queue: String,
    /// Batches currently claimed by a worker.
    pub processing_queue: String,
    /// Batches finished successfully.
    pub completed_queue: String,
    /// Batches whose worker reported failure.
    pub failed_queue: String,
    /// Hash of liveness timestamps keyed by batch id or worker id. Workers
    /// must heartbeat here; no other hash name is read.
    pub heartbeats: String,
    /// Hash of lease tokens keyed by batch id.
    pub leases: String,
    /// Coordinator lock for single-coordinator mode.
    pub coordinator: String,
}

impl JobKeys {
    pub fn new(prefix: &str, job_id: &str) -> Self {
        let key = |name: &str| format!("{}:{}:{}", prefix, name, job_id);
        Self {
            job_id: job_id.to_string(),
            config: key("config"),
            status: key("status"),
            metrics: key("metrics"),
            task_queue: key("task_queue"),
            processing_queue: key("processing_queue"),
            completed_queue: key("completed_queue"),
            failed_queue: key("failed_queue"),
            heartbeats: key("heartbeats"),
            leases: key("leases"),
            coordinator: key("coordinator"),
        }
    }

    /// Keys using the default prefix.
    pub fn for_job(job_id: &str) -> Self {
        Self::new(DEFAULT_KEY_PREFIX, job_id)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// The four batch queues, in lifecycle order.
    pub fn queues(&self) -> [&str; 4] {
        [
            &self.task_queue,
            &self.processing_queue,
            &self.completed_queue,
            &self.failed_queue,
        ]
    }

    /// Everything the initializer wipes before seeding a job.
    ///
    /// The config key is not included: it is written before the reset.
    pub fn resettable(&self) -> Vec<&str> {
        let mut keys = self.queues().to_vec();
        keys.extend([
            self.heartbeats.as_str(),
            self.leases.as_str(),
            self.status.as_str(),
            self.metrics.as_str(),
        ]);
        keys
    }
}
