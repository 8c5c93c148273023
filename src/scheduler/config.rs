//! Coordinator configuration.
//!
//! Settings come from defaults, then environment variables, then CLI flags
//! (applied by the caller through the `with_*` builders).

use std::time::Duration;

use thiserror::Error;

use crate::store::keys::DEFAULT_KEY_PREFIX;
use crate::store::RetryPolicy;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for a coordinator run.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    // Store settings
    /// Redis connection URL.
    pub redis_url: String,
    /// Prefix of every key the job uses.
    pub key_prefix: String,
    /// Retry/timeout policy for store operations.
    pub retry: RetryPolicy,

    // Job settings
    /// Items per batch for new jobs (resumed jobs keep their stored size).
    pub batch_size: usize,

    // Monitor settings
    /// Delay between progress polls.
    pub poll_interval: Duration,
    /// Heartbeat age after which a processing batch counts as stalled.
    pub stall_threshold: Duration,
    /// Minimum delay between periodic recovery passes.
    pub recovery_interval: Duration,
    /// Heartbeat age under which a worker counts as active.
    pub liveness_window: Duration,

    // Single-coordinator mode
    /// TTL of the coordinator lock; `None` disables the lock.
    pub coordinator_lease_ttl: Option<Duration>,
}

/// Default coordinator lock TTL when exclusive mode is switched on.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            retry: RetryPolicy::default(),

            batch_size: 50,

            poll_interval: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(300),
            recovery_interval: Duration::from_secs(60),
            liveness_window: Duration::from_secs(30),

            coordinator_lease_ttl: None,
        }
    }
}

impl CoordinatorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`: Redis connection URL (default: redis://localhost:6379)
    /// - `COORDINATOR_KEY_PREFIX`: Key prefix (default: backfill)
    /// - `COORDINATOR_BATCH_SIZE`: Items per batch (default: 50)
    /// - `COORDINATOR_POLL_INTERVAL_SECS`: Poll interval (default: 5)
    /// - `COORDINATOR_STALL_THRESHOLD_SECS`: Stall threshold (default: 300)
    /// - `COORDINATOR_RECOVERY_INTERVAL_SECS`: Recovery interval (default: 60)
    /// - `COORDINATOR_LIVENESS_WINDOW_SECS`: Active worker window (default: 30)
    /// - `COORDINATOR_EXCLUSIVE`: Hold a coordinator lock (default: false)
    /// - `COORDINATOR_LEASE_TTL_SECS`: Coordinator lock TTL (default: 30)
    /// - `COORDINATOR_STORE_MAX_ATTEMPTS`: Attempts per store call (default: 3)
    /// - `COORDINATOR_STORE_RETRY_DELAY_MS`: Base backoff delay (default: 200)
    /// - `COORDINATOR_STORE_TIMEOUT_SECS`: Timeout per store call (default: 10)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Store settings
        if let Some(val) = lookup("REDIS_URL") {
            config.redis_url = val;
        }

        if let Some(val) = lookup("COORDINATOR_KEY_PREFIX") {
            config.key_prefix = val;
        }

        if let Some(val) = lookup("COORDINATOR_STORE_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_env_value(&val, "COORDINATOR_STORE_MAX_ATTEMPTS")?;
        }

        if let Some(val) = lookup("COORDINATOR_STORE_RETRY_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "COORDINATOR_STORE_RETRY_DELAY_MS")?;
            config.retry.base_delay = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("COORDINATOR_STORE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "COORDINATOR_STORE_TIMEOUT_SECS")?;
            config.retry.op_timeout = Duration::from_secs(secs);
        }

        // Job settings
        if let Some(val) = lookup("COORDINATOR_BATCH_SIZE") {
            config.batch_size = parse_env_value(&val, "COORDINATOR_BATCH_SIZE")?;
        }

        // Monitor settings
        if let Some(val) = lookup("COORDINATOR_POLL_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "COORDINATOR_POLL_INTERVAL_SECS")?;
            config.poll_interval = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("COORDINATOR_STALL_THRESHOLD_SECS") {
            let secs: u64 = parse_env_value(&val, "COORDINATOR_STALL_THRESHOLD_SECS")?;
            config.stall_threshold = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("COORDINATOR_RECOVERY_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "COORDINATOR_RECOVERY_INTERVAL_SECS")?;
            config.recovery_interval = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("COORDINATOR_LIVENESS_WINDOW_SECS") {
            let secs: u64 = parse_env_value(&val, "COORDINATOR_LIVENESS_WINDOW_SECS")?;
            config.liveness_window = Duration::from_secs(secs);
        }

        // Single-coordinator mode
        let exclusive = match lookup("COORDINATOR_EXCLUSIVE") {
            Some(val) => parse_env_bool(&val, "COORDINATOR_EXCLUSIVE")?,
            None => false,
        };

        if exclusive {
            let ttl = match lookup("COORDINATOR_LEASE_TTL_SECS") {
                Some(val) => {
                    Duration::from_secs(parse_env_value(&val, "COORDINATOR_LEASE_TTL_SECS")?)
                }
                None => DEFAULT_LEASE_TTL,
            };
            config.coordinator_lease_ttl = Some(ttl);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.key_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "key_prefix cannot be empty".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "store max_attempts must be at least 1".to_string(),
            ));
        }

        if self.retry.op_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "store timeout must be greater than 0".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.stall_threshold.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "stall_threshold must be greater than 0".to_string(),
            ));
        }

        if self.recovery_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "recovery_interval must be greater than 0".to_string(),
            ));
        }

        if self.liveness_window.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "liveness_window must be greater than 0".to_string(),
            ));
        }

        if let Some(ttl) = self.coordinator_lease_ttl {
            if ttl <= self.poll_interval {
                return Err(ConfigError::ValidationFailed(
                    "coordinator lease TTL must exceed poll_interval".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Builder method to set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Builder method to set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to set the stall threshold.
    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    /// Builder method to set the recovery interval.
    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    /// Builder method to set the liveness window.
    pub fn with_liveness_window(mut self, window: Duration) -> Self {
        self.liveness_window = window;
        self
    }

    /// Builder method to enable the coordinator lock with the given TTL.
    pub fn with_coordinator_lease(mut self, ttl: Duration) -> Self {
        self.coordinator_lease_ttl = Some(ttl);
        self
    }

    /// Builder method to set the store retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();

        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert_eq!(config.key_prefix, "backfill");
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.stall_threshold, Duration::from_secs(300));
        assert_eq!(config.recovery_interval, Duration::from_secs(60));
        assert_eq!(config.liveness_window, Duration::from_secs(30));
        assert!(config.coordinator_lease_ttl.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = CoordinatorConfig::from_lookup(lookup_from(&[
            ("REDIS_URL", "redis://queue:6380"),
            ("COORDINATOR_BATCH_SIZE", "25"),
            ("COORDINATOR_POLL_INTERVAL_SECS", "2"),
            ("COORDINATOR_STALL_THRESHOLD_SECS", "120"),
            ("COORDINATOR_EXCLUSIVE", "yes"),
            ("COORDINATOR_STORE_RETRY_DELAY_MS", "50"),
        ]))
        .expect("valid env");

        assert_eq!(config.redis_url, "redis://queue:6380");
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.stall_threshold, Duration::from_secs(120));
        assert_eq!(config.coordinator_lease_ttl, Some(DEFAULT_LEASE_TTL));
        assert_eq!(config.retry.base_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_from_lookup_invalid_value() {
        let err = CoordinatorConfig::from_lookup(lookup_from(&[("COORDINATOR_BATCH_SIZE", "-1")]))
            .expect_err("negative batch size should fail");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = CoordinatorConfig::from_lookup(lookup_from(&[("COORDINATOR_EXCLUSIVE", "maybe")]))
            .expect_err("bad bool should fail");
        assert!(err.to_string().contains("COORDINATOR_EXCLUSIVE"));
    }

    #[test]
    fn test_validation() {
        assert!(CoordinatorConfig::new().with_batch_size(0).validate().is_err());
        assert!(CoordinatorConfig::new()
            .with_poll_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(CoordinatorConfig::new()
            .with_poll_interval(Duration::from_secs(10))
            .with_coordinator_lease(Duration::from_secs(5))
            .validate()
            .is_err());
        assert!(CoordinatorConfig::new()
            .with_coordinator_lease(Duration::from_secs(30))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_builder() {
        let config = CoordinatorConfig::new()
            .with_redis_url("redis://custom:6379")
            .with_key_prefix("sync")
            .with_batch_size(100)
            .with_recovery_interval(Duration::from_secs(120))
            .with_liveness_window(Duration::from_secs(15));

        assert_eq!(config.redis_url, "redis://custom:6379");
        assert_eq!(config.key_prefix, "sync");
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.recovery_interval, Duration::from_secs(120));
        assert_eq!(config.liveness_window, Duration::from_secs(15));
    }
}
