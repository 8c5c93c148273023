//! batch-coordinator: fault-tolerant coordination of distributed batch jobs.
//!
//! Work items are partitioned into batches, published to a shared queue
//! store and tracked until every batch completes. Batches held by crashed
//! or hung workers are detected through heartbeats and requeued.

pub mod cli;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod store;

pub use error::{CoordinatorError, ModelError, StoreError};
