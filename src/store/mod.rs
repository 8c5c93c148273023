//! Queue store adapter.
//!
//! The coordinator and its workers share state through a networked key-value
//! store that offers ordered lists, hashes and scalar keys. This module
//! defines the contract the coordinator needs from that store ([`QueueStore`])
//! and two implementations:
//!
//! - [`RedisStore`]: production backend on a Redis connection manager, with
//!   retry/backoff for transient failures and a per-operation timeout
//! - [`MemoryStore`]: in-process backend with a controllable clock, used by
//!   tests and dry runs
//!
//! # Contract
//!
//! Every single operation is atomic and immediately visible to all clients.
//! No transaction spans multiple keys; callers must tolerate interleavings
//! between consecutive operations. Lists are FIFO: `push` appends to the
//! tail and `pop` removes from the head.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub mod keys;
pub mod memory;
pub mod redis_store;
pub mod retry;

pub use keys::JobKeys;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use retry::RetryPolicy;

/// Operations the coordinator requires from the shared store.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Appends a value to the tail of a list.
    async fn push(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Appends several values to the tail of a list, in order.
    async fn push_all(&self, key: &str, values: &[String]) -> Result<(), StoreError>;

    /// Removes and returns the head of a list.
    async fn pop(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Atomically moves the head of `src` to the tail of `dst`.
    async fn move_head(&self, src: &str, dst: &str) -> Result<Option<String>, StoreError>;

    /// Removes every occurrence of `value` from a list, returning how many
    /// entries were removed.
    async fn remove(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    /// Returns a snapshot of the whole list.
    async fn range(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Returns the length of a list.
    async fn len(&self, key: &str) -> Result<usize, StoreError>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    async fn hash_set_many(&self, key: &str, fields: &[(&str, String)])
        -> Result<(), StoreError>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Returns all fields of a hash; a missing hash is an empty map.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Adds `delta` to an integer hash field and returns the new value.
    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;

    async fn hash_delete(&self, key: &str, field: &str) -> Result<(), StoreError>;

    /// Replaces `field` with `new` only if it currently equals `expected`.
    ///
    /// `new = None` deletes the field. Returns whether the swap happened.
    async fn hash_compare_and_swap(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        new: Option<&str>,
    ) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Deletes the given keys of any type.
    async fn delete(&self, keys: &[&str]) -> Result<(), StoreError>;

    /// Sets `key` with an expiry only if it does not exist yet.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Refreshes the expiry of `key` only if it still holds `expected`.
    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Deletes `key` only if it still holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Coarse wall-clock time in seconds since the Unix epoch, as seen by the store.
    async fn now(&self) -> Result<f64, StoreError>;
}
