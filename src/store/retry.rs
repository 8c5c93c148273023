//! Retry with exponential backoff for transient store failures.

use std::future::Future;
use std::time::Duration;

use crate::error::StoreError;

/// Default number of attempts per store operation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay between attempts.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);

/// Default upper bound for one store round trip.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// How a single store operation is retried and bounded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles afterward.
    pub base_delay: Duration,
    /// Timeout for each attempt.
    pub op_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 1).min(16);
        self.base_delay.saturating_mul(factor)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.delay_for(attempt);
                tracing::debug!(
                    operation = operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying store operation after transient failure"
                );
                tokio::time::sleep(delay).await;
            }

            let result = match tokio::time::timeout(self.op_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout {
                    operation,
                    timeout: self.op_timeout,
                }),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        operation = operation,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %err,
                        "Transient store error"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(StoreError::RetriesExhausted {
            operation,
            attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no error captured".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            op_timeout: Duration::from_millis(200),
        }
    }

    fn transient() -> StoreError {
        StoreError::ConnectionFailed("connection reset".to_string())
    }

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast_policy()
            .run("get", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(transient())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.expect("third attempt succeeds"), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy()
            .run("lpop", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;

        assert!(matches!(
            result,
            Err(StoreError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy()
            .run("hincrby", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(StoreError::UnexpectedValue {
                        key: "k".to_string(),
                        message: "not an integer".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(StoreError::UnexpectedValue { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_attempt_times_out() {
        let policy = RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
            op_timeout: Duration::from_millis(10),
        };
        let result: Result<(), _> = policy
            .run("get", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(StoreError::RetriesExhausted { .. })));
    }
}
