//! Fault-tolerant batch coordination over a shared queue store.
//!
//! This module provides the coordinator and the worker protocol:
//!
//! - **Initializer**: partitions items into batches and seeds the queues
//! - **RecoveryEngine**: requeues failed batches and batches whose worker
//!   stopped heartbeating
//! - **ProgressMonitor**: polls progress, runs recovery periodically and
//!   detects completion
//! - **Coordinator**: resume-or-initialize facade over the above
//! - **WorkerClient** / **Worker**: claim, heartbeat and finish batches
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────┐
//!                  │ Coordinator  │── initialize / recover / monitor
//!                  └──────┬───────┘
//!                         │
//!   ┌─────────────────────▼──────────────────────┐
//!   │                 Redis                      │
//!   │ task_queue ─► processing_queue ─► completed│
//!   │      ▲               │         └─► failed  │
//!   │      └── recovery ◄──┘              │      │
//!   │      └──────────── recovery ◄───────┘      │
//!   └─────────────────────▲──────────────────────┘
//!                         │ claim / heartbeat / finish
//!         ┌───────────────┼───────────────┐
//!         ▼               ▼               ▼
//!    ┌─────────┐     ┌─────────┐     ┌─────────┐
//!    │ Worker 1│     │ Worker 2│     │ Worker N│
//!    └─────────┘     └─────────┘     └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use batch_coordinator::scheduler::{Coordinator, CoordinatorConfig};
//! use batch_coordinator::store::RedisStore;
//!
//! let config = CoordinatorConfig::from_env()?;
//! let store = Arc::new(RedisStore::connect(&config.redis_url, config.retry).await?);
//!
//! let coordinator = Coordinator::new(store, config, "20240101120000");
//! let exit = coordinator
//!     .run(&items, async { tokio::signal::ctrl_c().await.ok(); })
//!     .await?;
//! ```
//!
//! # Reliability
//!
//! - **Atomic claim**: workers move batches with `LMOVE`, so a batch is never
//!   in two queues at once
//! - **Crash recovery**: batches with stale heartbeats are requeued
//! - **Leases**: a live worker's batch is never requeued from under it
//! - **At-least-once**: handlers must be idempotent

pub mod config;
pub mod coordinator;
pub mod initializer;
pub mod job;
pub mod lease;
pub mod monitor;
pub mod recovery;
pub mod worker;

// Re-export main types for convenience
pub use config::{ConfigError, CoordinatorConfig};
pub use coordinator::{Coordinator, JobStart};
pub use initializer::initialize_job;
pub use job::{
    batch_count, partition_items, Batch, JobConfig, JobMetrics, JobStatus, StatusCounters,
};
pub use lease::CoordinatorLease;
pub use monitor::{MonitorExit, MonitorSettings, PollOutcome, ProgressMonitor, ProgressSnapshot};
pub use recovery::{QueueDepths, Reconciliation, RecoveryEngine};
pub use worker::{BatchHandler, BatchReport, ClaimedBatch, Worker, WorkerClient, WorkerStats};
