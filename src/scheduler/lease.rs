//! Time-boxed coordinator lock.
//!
//! Only one coordinator may monitor a job at a time when exclusive mode is
//! on. The lock is a store key holding the holder's token with a TTL; the
//! holder renews it every poll. If the coordinator dies the key expires and
//! another coordinator can take over.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::store::{JobKeys, QueueStore};

/// A held coordinator lock.
pub struct CoordinatorLease {
    store: Arc<dyn QueueStore>,
    job_id: String,
    key: String,
    token: String,
    ttl: Duration,
}

impl std::fmt::Debug for CoordinatorLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorLease")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl CoordinatorLease {
    /// Takes the coordinator lock for the job.
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError::LeaseHeld` if another coordinator holds it.
    pub async fn acquire(
        store: Arc<dyn QueueStore>,
        keys: &JobKeys,
        ttl: Duration,
    ) -> Result<Self, CoordinatorError> {
        let token = format!("{}:{}", std::process::id(), Uuid::new_v4());

        if !store.set_if_absent(&keys.coordinator, &token, ttl).await? {
            let holder = store
                .get(&keys.coordinator)
                .await?
                .unwrap_or_else(|| "unknown".to_string());
            return Err(CoordinatorError::LeaseHeld {
                job_id: keys.job_id().to_string(),
                holder,
            });
        }

        info!(
            job_id = %keys.job_id(),
            token = %token,
            ttl_secs = ttl.as_secs(),
            "Acquired coordinator lease"
        );

        Ok(Self {
            store,
            job_id: keys.job_id().to_string(),
            key: keys.coordinator.clone(),
            token,
            ttl,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Extends the lock by another TTL.
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError::LeaseLost` if the lock expired or now
    /// belongs to someone else.
    pub async fn renew(&self) -> Result<(), CoordinatorError> {
        if self
            .store
            .compare_and_expire(&self.key, &self.token, self.ttl)
            .await?
        {
            debug!(job_id = %self.job_id, "Renewed coordinator lease");
            Ok(())
        } else {
            warn!(job_id = %self.job_id, "Coordinator lease lost");
            Err(CoordinatorError::LeaseLost(self.job_id.clone()))
        }
    }

    /// Gives the lock up if it is still ours.
    pub async fn release(self) -> Result<(), CoordinatorError> {
        let released = self
            .store
            .compare_and_delete(&self.key, &self.token)
            .await?;
        if released {
            info!(job_id = %self.job_id, "Released coordinator lease");
        } else {
            debug!(job_id = %self.job_id, "Coordinator lease already gone at release");
        }
        Ok(())
    }
}
