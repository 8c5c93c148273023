//! Job and batch model for the coordinator.
//!
//! This module defines the records shared through the store:
//!
//! - `JobConfig`: one coordinated run, stored as JSON under the config key
//! - `JobStatus`: lifecycle of a job
//! - `Batch`: an immutable partition of work items, stored as JSON in the queues
//! - `JobMetrics`: item-level counters, stored as a hash
//! - `StatusCounters`: batch-level counters, stored as a hash
//!
//! Everything here is pure data; no store I/O happens in this module.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Lifecycle of a job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Config written, queues being seeded.
    Initializing,
    /// All batches published, waiting for a coordinator loop.
    Ready,
    /// A coordinator is watching progress.
    Monitoring,
    /// Every batch completed.
    Completed,
}

impl JobStatus {
    /// Returns whether moving from `self` to `next` keeps the lifecycle monotonic.
    ///
    /// Re-entering the same state is allowed (a resumed job re-enters
    /// `Monitoring`).
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        next >= self
    }

    pub fn is_terminal(self) -> bool {
        self == JobStatus::Completed
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Initializing => write!(f, "initializing"),
            JobStatus::Ready => write!(f, "ready"),
            JobStatus::Monitoring => write!(f, "monitoring"),
            JobStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Configuration and lifecycle record of one coordinated job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobConfig {
    /// Stable identifier; every per-job key is derived from it.
    pub job_id: String,
    /// Maximum items per batch.
    pub batch_size: usize,
    /// Number of input items, fixed at initialization.
    #[serde(default)]
    pub total_items: usize,
    /// Number of batches, fixed at initialization.
    #[serde(default)]
    pub total_batches: usize,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobConfig {
    /// Creates a config in the `Initializing` state.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::InvalidBatchSize` if `batch_size` is zero.
    pub fn new(
        job_id: impl Into<String>,
        batch_size: usize,
        total_items: usize,
    ) -> Result<Self, ModelError> {
        validate_batch_size(batch_size as i64)?;
        Ok(Self {
            job_id: job_id.into(),
            batch_size,
            total_items,
            total_batches: batch_count(total_items, batch_size),
            status: JobStatus::Initializing,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        })
    }

    /// Moves the job to `next`, stamping `started_at`/`completed_at` the
    /// first time the matching state is reached.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), ModelError> {
        if !self.status.can_transition_to(next) {
            return Err(ModelError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        match next {
            JobStatus::Monitoring if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            JobStatus::Completed if self.completed_at.is_none() => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, ModelError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a stored config, validating its batch size.
    pub fn from_json(job_id: &str, raw: &str) -> Result<Self, ModelError> {
        let config: JobConfig =
            serde_json::from_str(raw).map_err(|e| ModelError::MalformedConfig {
                job_id: job_id.to_string(),
                message: e.to_string(),
            })?;
        if config.batch_size == 0 {
            return Err(ModelError::MalformedConfig {
                job_id: job_id.to_string(),
                message: "batch_size must be positive".to_string(),
            });
        }
        Ok(config)
    }
}

/// Rejects non-positive batch sizes.
pub fn validate_batch_size(batch_size: i64) -> Result<usize, ModelError> {
    if batch_size <= 0 {
        return Err(ModelError::InvalidBatchSize(batch_size));
    }
    Ok(batch_size as usize)
}

/// Number of batches needed for `total_items` items: `ceil(total / batch_size)`.
pub fn batch_count(total_items: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        return 0;
    }
    total_items.div_ceil(batch_size)
}

/// Batch identifier for the `index`-th batch of a job.
pub fn batch_id_for(job_id: &str, index: usize) -> String {
    format!("{}:batch:{}", job_id, index)
}

/// An immutable partition of work items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    /// `{job_id}:batch:{index}`, stable across retries.
    pub batch_id: String,
    /// Work item identifiers, in input order. Records serialized with the
    /// older `dids` name still parse; only the record format is covered.
    #[serde(alias = "dids")]
    pub items: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    /// Creates a batch, rejecting an empty item list.
    pub fn new(batch_id: impl Into<String>, items: Vec<String>) -> Result<Self, ModelError> {
        let batch_id = batch_id.into();
        if items.is_empty() {
            return Err(ModelError::EmptyBatch(batch_id));
        }
        Ok(Self {
            batch_id,
            items,
            created_at: Utc::now(),
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn to_json(&self) -> Result<String, ModelError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a queue record.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::MalformedBatch` for invalid JSON and
    /// `ModelError::EmptyBatch` for a record without items.
    pub fn from_json(raw: &str) -> Result<Self, ModelError> {
        let batch: Batch =
            serde_json::from_str(raw).map_err(|e| ModelError::MalformedBatch(e.to_string()))?;
        if batch.items.is_empty() {
            return Err(ModelError::EmptyBatch(batch.batch_id));
        }
        Ok(batch)
    }
}

/// Splits `items` into order-preserving batches of at most `batch_size`.
///
/// # Errors
///
/// Returns `ModelError::EmptyInput` for an empty item list and
/// `ModelError::InvalidBatchSize` for a zero batch size.
pub fn partition_items(
    job_id: &str,
    items: &[String],
    batch_size: usize,
) -> Result<Vec<Batch>, ModelError> {
    validate_batch_size(batch_size as i64)?;
    if items.is_empty() {
        return Err(ModelError::EmptyInput);
    }

    items
        .chunks(batch_size)
        .enumerate()
        .map(|(index, chunk)| Batch::new(batch_id_for(job_id, index), chunk.to_vec()))
        .collect()
}

// Hash field names shared with workers.
pub const TOTAL_ITEMS: &str = "total_items";
pub const PROCESSED_ITEMS: &str = "processed_items";
pub const COMPLETED_ITEMS: &str = "completed_items";
pub const FAILED_ITEMS: &str = "failed_items";
pub const START_TIME: &str = "start_time";
pub const API_CALLS: &str = "api_calls";
pub const RATE_LIMIT_DELAYS: &str = "rate_limit_delays";
pub const RECOVERED_FAILED: &str = "recovered_failed";
pub const RECOVERED_STALLED: &str = "recovered_stalled";

pub const TOTAL_BATCHES: &str = "total_batches";
pub const PENDING_BATCHES: &str = "pending_batches";
pub const PROCESSING_BATCHES: &str = "processing_batches";
pub const COMPLETED_BATCHES: &str = "completed_batches";
pub const FAILED_BATCHES: &str = "failed_batches";

fn parse_field<T: std::str::FromStr + Default>(
    hash: &HashMap<String, String>,
    names: &[&str],
) -> Result<T, ModelError> {
    let Some(raw) = names.iter().find_map(|name| hash.get(*name)) else {
        return Ok(T::default());
    };
    raw.trim().parse().map_err(|_| ModelError::InvalidField {
        field: names[0].to_string(),
        value: raw.clone(),
    })
}

/// Item-level counters for a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobMetrics {
    pub total_items: i64,
    pub processed_items: i64,
    pub completed_items: i64,
    pub failed_items: i64,
    /// Epoch seconds when the job was seeded.
    pub start_time: f64,
    pub api_calls: i64,
    pub rate_limit_delays: i64,
    pub recovered_failed: i64,
    pub recovered_stalled: i64,
}

impl JobMetrics {
    /// Fresh metrics for a job of `total_items` items started at `start_time`.
    pub fn seed(total_items: usize, start_time: f64) -> Self {
        Self {
            total_items: total_items as i64,
            start_time,
            ..Self::default()
        }
    }

    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (TOTAL_ITEMS, self.total_items.to_string()),
            (PROCESSED_ITEMS, self.processed_items.to_string()),
            (COMPLETED_ITEMS, self.completed_items.to_string()),
            (FAILED_ITEMS, self.failed_items.to_string()),
            (START_TIME, self.start_time.to_string()),
            (API_CALLS, self.api_calls.to_string()),
            (RATE_LIMIT_DELAYS, self.rate_limit_delays.to_string()),
            (RECOVERED_FAILED, self.recovered_failed.to_string()),
            (RECOVERED_STALLED, self.recovered_stalled.to_string()),
        ]
    }

    /// Reads metrics from a hash snapshot. Missing fields read as zero;
    /// the older `*_dids` field names are accepted. This only covers the
    /// field names inside the metrics hash, not a different key layout.
    pub fn from_hash(hash: &HashMap<String, String>) -> Result<Self, ModelError> {
        Ok(Self {
            total_items: parse_field(hash, &[TOTAL_ITEMS, "total_dids"])?,
            processed_items: parse_field(hash, &[PROCESSED_ITEMS, "processed_dids"])?,
            completed_items: parse_field(hash, &[COMPLETED_ITEMS, "completed_dids"])?,
            failed_items: parse_field(hash, &[FAILED_ITEMS, "failed_dids"])?,
            start_time: parse_field(hash, &[START_TIME])?,
            api_calls: parse_field(hash, &[API_CALLS])?,
            rate_limit_delays: parse_field(hash, &[RATE_LIMIT_DELAYS])?,
            recovered_failed: parse_field(hash, &[RECOVERED_FAILED])?,
            recovered_stalled: parse_field(hash, &[RECOVERED_STALLED])?,
        })
    }

    /// Items not yet processed.
    pub fn remaining_items(&self) -> i64 {
        (self.total_items - self.processed_items).max(0)
    }
}

/// Batch-level counters for a job.
///
/// Invariant: `pending + processing + completed + failed == total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounters {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl StatusCounters {
    /// Counters of a freshly seeded job: every batch pending.
    pub fn seeded(total_batches: usize) -> Self {
        Self {
            total: total_batches as i64,
            pending: total_batches as i64,
            ..Self::default()
        }
    }

    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (TOTAL_BATCHES, self.total.to_string()),
            (PENDING_BATCHES, self.pending.to_string()),
            (PROCESSING_BATCHES, self.processing.to_string()),
            (COMPLETED_BATCHES, self.completed.to_string()),
            (FAILED_BATCHES, self.failed.to_string()),
        ]
    }

    pub fn from_hash(hash: &HashMap<String, String>) -> Result<Self, ModelError> {
        Ok(Self {
            total: parse_field(hash, &[TOTAL_BATCHES])?,
            pending: parse_field(hash, &[PENDING_BATCHES])?,
            processing: parse_field(hash, &[PROCESSING_BATCHES])?,
            completed: parse_field(hash, &[COMPLETED_BATCHES])?,
            failed: parse_field(hash, &[FAILED_BATCHES])?,
        })
    }

    /// Sum of the four bucket counters.
    pub fn accounted(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }

    /// Returns whether the bucket counters add up to the total.
    pub fn is_consistent(&self) -> bool {
        self.accounted() == self.total
    }

    /// Returns whether every batch of a non-empty job has completed.
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.completed >= self.total
    }

    /// Completed batches as a percentage of the total.
    pub fn progress_percent(&self) -> f64 {
        if self.total <= 0 {
            return 0.0;
        }
        (self.completed as f64 / self.total as f64 * 100.0).min(100.0)
    }
}
