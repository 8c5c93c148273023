//! Job initialization: partition the items and seed the store.

use tracing::{debug, info};

use super::job::{partition_items, Batch, JobConfig, JobMetrics, JobStatus, StatusCounters};
use crate::error::CoordinatorError;
use crate::store::{JobKeys, QueueStore};

/// Seeds a fresh job and returns its config in the `Ready` state.
///
/// This is a destructive reset: every queue, heartbeat, lease, counter and
/// metric of `keys.job_id()` is wiped before the batches are published.
/// Callers decide between a new job and a resume before calling this.
///
/// # Errors
///
/// Fails with `ModelError::EmptyInput` or `ModelError::InvalidBatchSize`
/// before touching the store, and with a store error if seeding fails part
/// way. A partially seeded job stays in `Initializing` and is not resumable
/// as-is; rerunning the initializer resets it.
pub async fn initialize_job(
    store: &dyn QueueStore,
    keys: &JobKeys,
    items: &[String],
    batch_size: usize,
) -> Result<JobConfig, CoordinatorError> {
    let job_id = keys.job_id();
    let batches = partition_items(job_id, items, batch_size)?;

    let mut config = JobConfig::new(job_id, batch_size, items.len())?;
    store.set(&keys.config, &config.to_json()?).await?;

    store.delete(&keys.resettable()).await?;
    debug!(job_id = %job_id, "Cleared previous job state");

    let records = batches
        .iter()
        .map(Batch::to_json)
        .collect::<Result<Vec<_>, _>>()?;
    store.push_all(&keys.task_queue, &records).await?;

    let start_time = store.now().await?;
    store
        .hash_set_many(
            &keys.metrics,
            &JobMetrics::seed(items.len(), start_time).to_fields(),
        )
        .await?;
    store
        .hash_set_many(
            &keys.status,
            &StatusCounters::seeded(batches.len()).to_fields(),
        )
        .await?;

    config.transition(JobStatus::Ready)?;
    store.set(&keys.config, &config.to_json()?).await?;

    info!(
        job_id = %job_id,
        total_items = config.total_items,
        total_batches = config.total_batches,
        batch_size = batch_size,
        "Job initialized"
    );

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::scheduler::job::PENDING_BATCHES;
    use crate::store::MemoryStore;

    fn items(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("did:plc:{:04}", i)).collect()
    }

    #[tokio::test]
    async fn test_initialize_seeds_queue_and_counters() {
        let store = MemoryStore::with_clock(1_000.0);
        let keys = JobKeys::for_job("job-1");

        let config = initialize_job(&store, &keys, &items(25), 10)
            .await
            .expect("initialize should succeed");

        assert_eq!(config.status, JobStatus::Ready);
        assert_eq!(config.total_batches, 3);

        let queued = store.range(&keys.task_queue).await.expect("range");
        assert_eq!(queued.len(), 3);
        let sizes: Vec<usize> = queued
            .iter()
            .map(|raw| Batch::from_json(raw).expect("valid batch").len())
            .collect();
        assert_eq!(sizes, vec![10, 10, 5]);

        let counters = StatusCounters::from_hash(
            &store.hash_get_all(&keys.status).await.expect("status"),
        )
        .expect("counters");
        assert_eq!(counters, StatusCounters::seeded(3));

        let metrics = JobMetrics::from_hash(
            &store.hash_get_all(&keys.metrics).await.expect("metrics"),
        )
        .expect("metrics");
        assert_eq!(metrics.total_items, 25);
        assert_eq!(metrics.processed_items, 0);
        assert!((metrics.start_time - 1_000.0).abs() < f64::EPSILON);

        let stored = store.get(&keys.config).await.expect("get").expect("config");
        let stored = JobConfig::from_json("job-1", &stored).expect("parse");
        assert_eq!(stored.status, JobStatus::Ready);
    }

    #[tokio::test]
    async fn test_initialize_resets_previous_state() {
        let store = MemoryStore::with_clock(1_000.0);
        let keys = JobKeys::for_job("job-1");

        store.push(&keys.failed_queue, "stale").await.expect("push");
        store
            .hash_set(&keys.heartbeats, "job-1:batch:9", "1.0")
            .await
            .expect("hset");
        store
            .hash_set(&keys.status, PENDING_BATCHES, "99")
            .await
            .expect("hset");

        initialize_job(&store, &keys, &items(4), 2)
            .await
            .expect("initialize should succeed");

        assert_eq!(store.len(&keys.failed_queue).await.expect("len"), 0);
        assert!(store
            .hash_get_all(&keys.heartbeats)
            .await
            .expect("hgetall")
            .is_empty());
        assert_eq!(
            store
                .hash_get(&keys.status, PENDING_BATCHES)
                .await
                .expect("hget"),
            Some("2".to_string())
        );
    }

    #[tokio::test]
    async fn test_initialize_rejects_empty_input_without_writes() {
        let store = MemoryStore::new();
        let keys = JobKeys::for_job("job-1");

        let err = initialize_job(&store, &keys, &[], 10)
            .await
            .expect_err("empty input should fail");

        assert!(matches!(
            err,
            CoordinatorError::Model(ModelError::EmptyInput)
        ));
        assert!(store.get(&keys.config).await.expect("get").is_none());
    }
}
