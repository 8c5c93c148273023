//! Error types for batch coordination.
//!
//! Errors are split along the boundaries of the system:
//! - Store errors from the queue/hash substrate (Redis or in-memory)
//! - Model errors from (de)serializing and validating jobs and batches
//! - Coordinator errors from the initializer, recovery engine, monitor and facade

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the queue store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the store.
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    /// The underlying Redis command failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// A single store operation did not finish in time.
    #[error("Store operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Transient failures persisted past the retry budget.
    #[error("Store operation '{operation}' failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        last_error: String,
    },

    /// A stored value could not be interpreted.
    #[error("Unexpected value at '{key}': {message}")]
    UnexpectedValue { key: String, message: String },
}

impl StoreError {
    /// Returns whether the error is worth retrying locally.
    ///
    /// Only connection-level failures and timeouts are transient; command
    /// errors (wrong type, script errors) are surfaced immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Redis(e) => {
                e.is_io_error()
                    || e.is_timeout()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
            }
            StoreError::Timeout { .. } | StoreError::ConnectionFailed(_) => true,
            StoreError::RetriesExhausted { .. } | StoreError::UnexpectedValue { .. } => false,
        }
    }
}

/// Errors that can occur when building, validating or decoding model records.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Batch '{0}' has no items")]
    EmptyBatch(String),

    #[error("Invalid batch size {0}: must be a positive integer")]
    InvalidBatchSize(i64),

    #[error("Cannot create a job with no items")]
    EmptyInput,

    #[error("Malformed batch record: {0}")]
    MalformedBatch(String),

    #[error("Malformed job config for '{job_id}': {message}")]
    MalformedConfig { job_id: String, message: String },

    #[error("Invalid value '{value}' for field '{field}'")]
    InvalidField { field: String, value: String },

    #[error("Invalid job status transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by the coordinator components.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Resume was requested for a job that has no stored config.
    #[error("Job '{0}' not found; refusing to resume")]
    JobNotFound(String),

    /// Another coordinator holds the lease for this job.
    #[error("Job '{job_id}' is already coordinated by '{holder}'")]
    LeaseHeld { job_id: String, holder: String },

    /// The coordinator lease expired or was taken over mid-run.
    #[error("Lost coordinator lease for job '{0}'")]
    LeaseLost(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = StoreError::Timeout {
            operation: "lpop",
            timeout: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("lpop"));
        assert!(err.to_string().contains("5s"));

        let err = StoreError::RetriesExhausted {
            operation: "hgetall",
            attempts: 3,
            last_error: "broken pipe".to_string(),
        };
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_store_error_transience() {
        let timeout = StoreError::Timeout {
            operation: "get",
            timeout: Duration::from_millis(10),
        };
        assert!(timeout.is_transient());

        let io = StoreError::Redis(redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert!(io.is_transient());

        let exhausted = StoreError::RetriesExhausted {
            operation: "get",
            attempts: 3,
            last_error: "x".to_string(),
        };
        assert!(!exhausted.is_transient());

        let bad = StoreError::UnexpectedValue {
            key: "k".to_string(),
            message: "not a number".to_string(),
        };
        assert!(!bad.is_transient());
    }

    #[test]
    fn test_coordinator_error_from_model() {
        let err: CoordinatorError = ModelError::EmptyInput.into();
        assert!(matches!(err, CoordinatorError::Model(ModelError::EmptyInput)));
        assert!(err.to_string().contains("no items"));
    }
}
