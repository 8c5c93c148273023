//! Coordinator facade: resume or initialize a job, then monitor it.
//!
//! ```text
//! check_existing_job ──► New ──────► initialize_job ──┐
//!                    └─► Resuming ─► recovery pass ───┴─► monitor ─► done
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use super::config::CoordinatorConfig;
use super::initializer::initialize_job;
use super::job::{JobConfig, JobStatus};
use super::lease::CoordinatorLease;
use super::monitor::{MonitorExit, MonitorSettings, ProgressMonitor};
use super::recovery::RecoveryEngine;
use crate::error::CoordinatorError;
use crate::store::{JobKeys, QueueStore};

/// What `check_existing_job` found in the store.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStart {
    /// No usable config; the job must be initialized.
    New,
    /// A seeded job exists and is resumed with its stored settings.
    Resuming(JobConfig),
}

/// Drives one job from start (or resume) to completion.
pub struct Coordinator {
    store: Arc<dyn QueueStore>,
    config: CoordinatorConfig,
    keys: JobKeys,
    metrics_file: Option<PathBuf>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn QueueStore>, config: CoordinatorConfig, job_id: &str) -> Self {
        let keys = JobKeys::new(&config.key_prefix, job_id);
        Self {
            store,
            config,
            keys,
            metrics_file: None,
        }
    }

    /// Writes the Prometheus text exposition to `path` after every poll.
    pub fn with_metrics_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.metrics_file = Some(path.into());
        self
    }

    pub fn keys(&self) -> &JobKeys {
        &self.keys
    }

    pub fn job_id(&self) -> &str {
        self.keys.job_id()
    }

    /// Looks for a stored config for this job.
    ///
    /// A job left in `Initializing` never finished seeding and is reported
    /// as `New` so it gets reset.
    ///
    /// # Errors
    ///
    /// A stored config that does not parse is fatal.
    pub async fn check_existing_job(&self) -> Result<JobStart, CoordinatorError> {
        let Some(raw) = self.store.get(&self.keys.config).await? else {
            return Ok(JobStart::New);
        };

        let config = JobConfig::from_json(self.job_id(), &raw)?;
        if config.status == JobStatus::Initializing {
            warn!(
                job_id = %self.job_id(),
                "Found a partially initialized job, it will be reset"
            );
            return Ok(JobStart::New);
        }

        Ok(JobStart::Resuming(config))
    }

    /// Resumes the job if it exists, otherwise initializes it from `items`,
    /// then monitors it until completion or `shutdown`.
    pub async fn run<F>(
        &self,
        items: &[String],
        shutdown: F,
    ) -> Result<MonitorExit, CoordinatorError>
    where
        F: Future<Output = ()>,
    {
        let start = self.check_existing_job().await?;
        self.drive(start, Some(items), shutdown).await
    }

    /// Resumes an existing job and monitors it.
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError::JobNotFound` if the job was never
    /// initialized; nothing is created in that case.
    pub async fn resume<F>(&self, shutdown: F) -> Result<MonitorExit, CoordinatorError>
    where
        F: Future<Output = ()>,
    {
        match self.check_existing_job().await? {
            JobStart::New => Err(CoordinatorError::JobNotFound(self.job_id().to_string())),
            start @ JobStart::Resuming(_) => self.drive(start, None, shutdown).await,
        }
    }

    async fn drive<F>(
        &self,
        start: JobStart,
        items: Option<&[String]>,
        shutdown: F,
    ) -> Result<MonitorExit, CoordinatorError>
    where
        F: Future<Output = ()>,
    {
        let lease = match self.config.coordinator_lease_ttl {
            Some(ttl) => {
                Some(CoordinatorLease::acquire(self.store.clone(), &self.keys, ttl).await?)
            }
            None => None,
        };

        if let Err(e) = self.prepare(start, items).await {
            if let Some(lease) = lease {
                if let Err(release_err) = lease.release().await {
                    warn!(error = %release_err, "Failed to release coordinator lease");
                }
            }
            return Err(e);
        }

        let mut monitor = ProgressMonitor::new(
            self.store.clone(),
            self.keys.clone(),
            MonitorSettings::from(&self.config),
        );
        if let Some(lease) = lease {
            monitor = monitor.with_lease(lease);
        }
        if let Some(path) = &self.metrics_file {
            monitor = monitor.with_metrics_file(path.clone());
        }

        monitor.run(shutdown).await
    }

    async fn prepare(
        &self,
        start: JobStart,
        items: Option<&[String]>,
    ) -> Result<(), CoordinatorError> {
        let config = match start {
            JobStart::New => {
                let items = items
                    .ok_or_else(|| CoordinatorError::JobNotFound(self.job_id().to_string()))?;
                info!(
                    job_id = %self.job_id(),
                    items = items.len(),
                    batch_size = self.config.batch_size,
                    "Starting new job"
                );
                initialize_job(self.store.as_ref(), &self.keys, items, self.config.batch_size)
                    .await?
            }
            JobStart::Resuming(config) => {
                info!(
                    job_id = %self.job_id(),
                    status = %config.status,
                    batch_size = config.batch_size,
                    total_batches = config.total_batches,
                    "Resuming existing job"
                );
                let recovery = RecoveryEngine::new(self.store.clone(), self.keys.clone());
                let failed = recovery.recover_failed_tasks().await?;
                let stalled = recovery
                    .recover_stalled_tasks(self.config.stall_threshold)
                    .await?;
                info!(
                    job_id = %self.job_id(),
                    failed = failed,
                    stalled = stalled,
                    "Recovered batches on resume"
                );
                config
            }
        };

        self.enter_monitoring(config).await
    }

    async fn enter_monitoring(&self, mut config: JobConfig) -> Result<(), CoordinatorError> {
        if config.status.is_terminal() {
            return Ok(());
        }
        config.transition(JobStatus::Monitoring)?;
        self.store.set(&self.keys.config, &config.to_json()?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::scheduler::job::JobMetrics;
    use crate::scheduler::worker::{BatchReport, WorkerClient};
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn config() -> CoordinatorConfig {
        CoordinatorConfig::new()
            .with_batch_size(10)
            .with_poll_interval(Duration::from_millis(5))
    }

    fn items(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("item-{}", i)).collect()
    }

    async fn stored_config(store: &MemoryStore, keys: &JobKeys) -> JobConfig {
        let raw = store.get(&keys.config).await.expect("get").expect("config");
        JobConfig::from_json(keys.job_id(), &raw).expect("parse")
    }

    fn interrupt() -> tokio::time::Sleep {
        tokio::time::sleep(Duration::from_millis(15))
    }

    #[tokio::test]
    async fn test_check_existing_job() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Coordinator::new(store.clone(), config(), "job");
        assert_eq!(
            coordinator.check_existing_job().await.expect("check"),
            JobStart::New
        );

        store
            .set(&coordinator.keys().config, "{broken")
            .await
            .expect("set");
        assert!(matches!(
            coordinator.check_existing_job().await,
            Err(CoordinatorError::Model(ModelError::MalformedConfig { .. }))
        ));
    }

    #[tokio::test]
    async fn test_new_job_enters_monitoring() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Coordinator::new(store.clone(), config(), "job");

        let exit = coordinator
            .run(&items(25), interrupt())
            .await
            .expect("run");
        assert_eq!(exit, MonitorExit::Interrupted);

        let stored = stored_config(&store, coordinator.keys()).await;
        assert_eq!(stored.status, JobStatus::Monitoring);
        assert!(stored.started_at.is_some());
        assert_eq!(stored.total_batches, 3);
    }

    #[tokio::test]
    async fn test_rerun_resumes_without_reseeding() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Coordinator::new(store.clone(), config(), "job");
        coordinator
            .run(&items(25), interrupt())
            .await
            .expect("first run");

        let keys = coordinator.keys().clone();
        let client = WorkerClient::new(store.clone(), keys.clone(), "w1");
        let claimed = client.claim().await.expect("claim").expect("batch");
        client
            .complete(claimed, BatchReport::default())
            .await
            .expect("complete");

        // Different batch size and items: the stored job wins.
        let rerun = Coordinator::new(store.clone(), config().with_batch_size(3), "job");
        assert!(matches!(
            rerun.check_existing_job().await.expect("check"),
            JobStart::Resuming(ref c) if c.batch_size == 10
        ));
        rerun.run(&items(4), interrupt()).await.expect("second run");

        assert_eq!(store.len(&keys.task_queue).await.expect("len"), 2);
        assert_eq!(store.len(&keys.completed_queue).await.expect("len"), 1);
    }

    #[tokio::test]
    async fn test_resume_missing_job_fails() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Coordinator::new(store.clone(), config(), "ghost");

        let err = coordinator
            .resume(interrupt())
            .await
            .expect_err("resume should fail");
        assert!(matches!(err, CoordinatorError::JobNotFound(ref id) if id == "ghost"));
        assert!(store
            .get(&coordinator.keys().config)
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn test_resume_recovers_stalled_batches() {
        let store = Arc::new(MemoryStore::with_clock(50_000.0));
        let coordinator = Coordinator::new(store.clone(), config(), "job");
        coordinator
            .run(&items(20), interrupt())
            .await
            .expect("first run");

        let keys = coordinator.keys().clone();
        let client = WorkerClient::new(store.clone(), keys.clone(), "crashed");
        client.claim().await.expect("claim").expect("batch");
        store.advance(Duration::from_secs(3600));

        coordinator.resume(interrupt()).await.expect("resume");

        assert_eq!(store.len(&keys.processing_queue).await.expect("len"), 0);
        assert_eq!(store.len(&keys.task_queue).await.expect("len"), 2);
    }

    #[tokio::test]
    async fn test_repeated_resume_leaves_state_untouched() {
        let store = Arc::new(MemoryStore::with_clock(50_000.0));
        let coordinator = Coordinator::new(store.clone(), config(), "job");
        coordinator
            .run(&items(30), interrupt())
            .await
            .expect("first run");

        let keys = coordinator.keys().clone();
        let client = WorkerClient::new(store.clone(), keys.clone(), "busy");
        let claimed = client.claim().await.expect("claim").expect("batch");

        let status = store.hash_get_all(&keys.status).await.expect("status");
        let metrics = store.hash_get_all(&keys.metrics).await.expect("metrics");
        let heartbeats = store.hash_get_all(&keys.heartbeats).await.expect("heartbeats");

        for _ in 0..2 {
            let exit = coordinator.resume(interrupt()).await.expect("resume");
            assert_eq!(exit, MonitorExit::Interrupted);

            assert_eq!(store.hash_get_all(&keys.status).await.expect("status"), status);
            assert_eq!(store.hash_get_all(&keys.metrics).await.expect("metrics"), metrics);
            assert_eq!(
                store.hash_get_all(&keys.heartbeats).await.expect("heartbeats"),
                heartbeats
            );
            assert_eq!(store.len(&keys.processing_queue).await.expect("len"), 1);
            assert_eq!(store.len(&keys.task_queue).await.expect("len"), 2);
        }

        let recorded = JobMetrics::from_hash(&metrics).expect("metrics");
        assert_eq!((recorded.recovered_failed, recorded.recovered_stalled), (0, 0));
        assert!(client
            .complete(claimed, BatchReport::default())
            .await
            .expect("worker still owns its batch"));
    }

    #[tokio::test]
    async fn test_exclusive_mode_rejects_second_coordinator() {
        let store = Arc::new(MemoryStore::new());
        let exclusive = config().with_coordinator_lease(Duration::from_secs(30));

        let keys = JobKeys::new(&exclusive.key_prefix, "job");
        let _held = CoordinatorLease::acquire(store.clone(), &keys, Duration::from_secs(30))
            .await
            .expect("acquire");

        let coordinator = Coordinator::new(store.clone(), exclusive, "job");
        let err = coordinator
            .run(&items(5), interrupt())
            .await
            .expect_err("lease held elsewhere");
        assert!(matches!(err, CoordinatorError::LeaseHeld { .. }));
        assert!(store.get(&keys.config).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_empty_input_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Coordinator::new(store, config(), "job");

        let err = coordinator
            .run(&[], interrupt())
            .await
            .expect_err("empty input");
        assert!(matches!(
            err,
            CoordinatorError::Model(ModelError::EmptyInput)
        ));
    }
}
