//! End-to-end tests for the coordinator and the worker protocol.
//!
//! The in-memory tests always run. The Redis tests need a live server and
//! are ignored by default:
//!
//! ```bash
//! REDIS_URL=redis://127.0.0.1:6379 cargo test --test coordinator_integration -- --ignored
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use batch_coordinator::scheduler::{
    Batch, BatchHandler, BatchReport, Coordinator, CoordinatorConfig, JobConfig, JobStatus,
    MonitorExit, RecoveryEngine, StatusCounters, Worker, WorkerClient,
};
use batch_coordinator::store::{JobKeys, MemoryStore, QueueStore, RedisStore, RetryPolicy};
use tokio::sync::broadcast;

fn items(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("did:plc:{:04}", i)).collect()
}

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig::new()
        .with_batch_size(10)
        .with_poll_interval(Duration::from_millis(10))
        .with_recovery_interval(Duration::from_millis(20))
}

fn interrupt_soon() -> tokio::time::Sleep {
    tokio::time::sleep(Duration::from_millis(30))
}

async fn stored_status(store: &dyn QueueStore, keys: &JobKeys) -> JobStatus {
    let raw = store
        .get(&keys.config)
        .await
        .expect("get config")
        .expect("config present");
    JobConfig::from_json(keys.job_id(), &raw)
        .expect("parse config")
        .status
}

async fn status_counters(store: &dyn QueueStore, keys: &JobKeys) -> StatusCounters {
    let hash = store.hash_get_all(&keys.status).await.expect("status hash");
    StatusCounters::from_hash(&hash).expect("parse counters")
}

/// Succeeds on every batch and counts the items it saw.
struct CountingHandler {
    items: AtomicUsize,
}

#[async_trait]
impl BatchHandler for CountingHandler {
    async fn process(&self, batch: &Batch) -> anyhow::Result<BatchReport> {
        self.items.fetch_add(batch.len(), Ordering::SeqCst);
        Ok(BatchReport {
            api_calls: batch.len() as i64,
            rate_limit_delays: 0,
        })
    }
}

#[tokio::test]
async fn test_job_survives_failure_and_completes() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(store.clone(), fast_config(), "20240101120000");
    let keys = coordinator.keys().clone();

    // Seed the job and stop monitoring right away.
    let exit = coordinator
        .run(&items(25), interrupt_soon())
        .await
        .expect("initial run");
    assert_eq!(exit, MonitorExit::Interrupted);
    assert_eq!(store.len(&keys.task_queue).await.expect("len"), 3);
    let c = status_counters(store.as_ref(), &keys).await;
    assert_eq!((c.total, c.pending, c.processing), (3, 3, 0));

    // Two batches complete, the last one fails.
    let client = WorkerClient::new(store.clone(), keys.clone(), "manual");
    let mut sizes = Vec::new();
    for outcome in [true, true, false] {
        let claimed = client.claim().await.expect("claim").expect("batch");
        sizes.push(claimed.batch.len());
        let finished = if outcome {
            client.complete(claimed, BatchReport::default()).await
        } else {
            client.fail(claimed, BatchReport::default()).await
        };
        assert!(finished.expect("finish"));
    }
    assert_eq!(sizes, vec![10, 10, 5]);
    assert!(client.claim().await.expect("claim").is_none());
    let c = status_counters(store.as_ref(), &keys).await;
    assert_eq!(
        (c.pending, c.processing, c.completed, c.failed),
        (0, 0, 2, 1)
    );

    let engine = RecoveryEngine::new(store.clone(), keys.clone());
    assert_eq!(engine.recover_failed_tasks().await.expect("recover"), 1);
    assert_eq!(store.len(&keys.task_queue).await.expect("len"), 1);
    assert_eq!(store.len(&keys.failed_queue).await.expect("len"), 0);
    let c = status_counters(store.as_ref(), &keys).await;
    assert_eq!(
        (c.pending, c.processing, c.completed, c.failed),
        (1, 0, 2, 0)
    );
    assert!(c.is_consistent());

    // A worker loop drains the rest while the coordinator monitors.
    let handler = Arc::new(CountingHandler {
        items: AtomicUsize::new(0),
    });
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let worker = Worker::new(
        WorkerClient::new(store.clone(), keys.clone(), "worker-1"),
        handler.clone(),
        shutdown_rx,
    )
    .with_poll_interval(Duration::from_millis(5))
    .with_max_idle_polls(20);
    let worker_task = tokio::spawn(worker.run());

    let exit = tokio::time::timeout(
        Duration::from_secs(10),
        coordinator.resume(std::future::pending::<()>()),
    )
    .await
    .expect("job should complete in time")
    .expect("resume");
    let _ = shutdown_tx.send(());
    let stats = worker_task.await.expect("worker task");

    let snapshot = match exit {
        MonitorExit::Completed(snapshot) => snapshot,
        other => panic!("expected completion, got {:?}", other),
    };
    assert_eq!(snapshot.counters.completed, 3);
    assert_eq!(snapshot.counters.pending, 0);
    assert_eq!(snapshot.counters.failed, 0);
    assert_eq!(snapshot.metrics.completed_items, 25);
    assert_eq!(snapshot.metrics.recovered_failed, 1);
    assert_eq!(snapshot.metrics.api_calls, 5);
    assert_eq!(stats.batches_completed, 1);
    assert_eq!(handler.items.load(Ordering::SeqCst), 5);

    assert_eq!(
        stored_status(store.as_ref(), &keys).await,
        JobStatus::Completed
    );
    assert_eq!(store.len(&keys.completed_queue).await.expect("len"), 3);
}

#[tokio::test]
async fn test_crashed_worker_batch_is_recovered() {
    let store = Arc::new(MemoryStore::with_clock(1_700_000_000.0));
    let config = fast_config().with_stall_threshold(Duration::from_secs(60));
    let coordinator = Coordinator::new(store.clone(), config, "crash");
    let keys = coordinator.keys().clone();
    coordinator
        .run(&items(10), interrupt_soon())
        .await
        .expect("initial run");

    // A worker claims the only batch and dies without heartbeating.
    let crashed = WorkerClient::new(store.clone(), keys.clone(), "crashed");
    let stale = crashed.claim().await.expect("claim").expect("batch");
    store.advance(Duration::from_secs(120));

    let engine = RecoveryEngine::new(store.clone(), keys.clone());
    assert_eq!(
        engine
            .recover_stalled_tasks(Duration::from_secs(60))
            .await
            .expect("recover"),
        1
    );

    // The replacement worker finishes it; the crashed worker's late result is dropped.
    let replacement = WorkerClient::new(store.clone(), keys.clone(), "replacement");
    let fresh = replacement.claim().await.expect("claim").expect("batch");
    assert_eq!(fresh.batch_id(), stale.batch_id());
    assert!(!crashed
        .complete(stale, BatchReport::default())
        .await
        .expect("late complete"));
    assert!(replacement
        .complete(fresh, BatchReport::default())
        .await
        .expect("complete"));

    let exit = tokio::time::timeout(
        Duration::from_secs(5),
        coordinator.resume(std::future::pending::<()>()),
    )
    .await
    .expect("job should complete in time")
    .expect("resume");
    let snapshot = match exit {
        MonitorExit::Completed(snapshot) => snapshot,
        other => panic!("expected completion, got {:?}", other),
    };
    assert_eq!(snapshot.counters.completed, 1);
    assert_eq!(snapshot.metrics.completed_items, 10);
    assert_eq!(snapshot.metrics.recovered_stalled, 1);
}

#[tokio::test]
async fn test_drifted_counters_are_reconciled() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(store.clone(), fast_config(), "drift");
    let keys = coordinator.keys().clone();
    coordinator
        .run(&items(30), interrupt_soon())
        .await
        .expect("initial run");

    store
        .hash_incr(&keys.status, "pending_batches", 7)
        .await
        .expect("incr");

    let engine = RecoveryEngine::new(store.clone(), keys.clone());
    let reconciliation = engine.reconcile_counters().await.expect("reconcile");
    assert!(reconciliation.changed());
    assert_eq!(reconciliation.before.pending, 10);
    assert_eq!(reconciliation.after.pending, 3);
    assert_eq!(reconciliation.after.total, 3);
}

// ============================================================================
// Redis-backed tests
// ============================================================================

async fn redis_store() -> Option<Arc<dyn QueueStore>> {
    let url = std::env::var("REDIS_URL").ok()?;
    let store = RedisStore::connect(&url, RetryPolicy::default())
        .await
        .expect("connect to REDIS_URL");
    Some(Arc::new(store))
}

fn unique_job_id(name: &str) -> String {
    format!("it-{}-{}", name, uuid::Uuid::new_v4().simple())
}

async fn cleanup(store: &dyn QueueStore, keys: &JobKeys) {
    let mut all = keys.resettable();
    all.push(keys.config.as_str());
    all.push(keys.coordinator.as_str());
    store.delete(&all).await.expect("cleanup");
}

#[tokio::test]
#[ignore = "requires a Redis server at REDIS_URL"]
async fn test_redis_job_round_trip() {
    let Some(store) = redis_store().await else {
        eprintln!("REDIS_URL not set, skipping");
        return;
    };
    let config = fast_config().with_key_prefix("batch_coordinator_it");
    let coordinator = Coordinator::new(store.clone(), config, &unique_job_id("roundtrip"));
    let keys = coordinator.keys().clone();

    coordinator
        .run(&items(25), interrupt_soon())
        .await
        .expect("initial run");
    assert_eq!(store.len(&keys.task_queue).await.expect("len"), 3);

    let client = WorkerClient::new(store.clone(), keys.clone(), "redis-worker");
    while let Some(claimed) = client.claim().await.expect("claim") {
        assert!(client
            .complete(claimed, BatchReport::default())
            .await
            .expect("complete"));
    }

    let exit = tokio::time::timeout(
        Duration::from_secs(10),
        coordinator.resume(std::future::pending::<()>()),
    )
    .await
    .expect("job should complete in time")
    .expect("resume");
    assert!(matches!(exit, MonitorExit::Completed(ref s) if s.metrics.completed_items == 25));
    assert_eq!(
        stored_status(store.as_ref(), &keys).await,
        JobStatus::Completed
    );

    cleanup(store.as_ref(), &keys).await;
}

#[tokio::test]
#[ignore = "requires a Redis server at REDIS_URL"]
async fn test_redis_exclusive_lease() {
    let Some(store) = redis_store().await else {
        eprintln!("REDIS_URL not set, skipping");
        return;
    };
    let job_id = unique_job_id("lease");
    let config = fast_config()
        .with_key_prefix("batch_coordinator_it")
        .with_coordinator_lease(Duration::from_secs(5));

    let keys = JobKeys::new(&config.key_prefix, &job_id);
    let held = batch_coordinator::scheduler::CoordinatorLease::acquire(
        store.clone(),
        &keys,
        Duration::from_secs(5),
    )
    .await
    .expect("acquire");

    let coordinator = Coordinator::new(store.clone(), config, &job_id);
    let err = coordinator
        .run(&items(5), interrupt_soon())
        .await
        .expect_err("lease is held");
    assert!(matches!(
        err,
        batch_coordinator::CoordinatorError::LeaseHeld { .. }
    ));

    held.release().await.expect("release");
    cleanup(store.as_ref(), &keys).await;
}
