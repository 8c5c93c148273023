//! In-process implementation of the queue store.
//!
//! Mirrors the Redis semantics the coordinator relies on (FIFO lists,
//! integer hash increments, compare-and-swap, expiring keys) behind a single
//! mutex, so every operation is atomic just like a Redis command. The clock
//! can be pinned and advanced by tests to exercise heartbeat staleness.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use super::QueueStore;
use crate::error::StoreError;

#[derive(Debug, Default)]
struct MemoryState {
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    /// Value plus optional absolute expiry in epoch seconds.
    strings: HashMap<String, (String, Option<f64>)>,
    /// Pinned clock; `None` follows the system clock.
    clock: Option<f64>,
}

impl MemoryState {
    fn now(&self) -> f64 {
        self.clock.unwrap_or_else(system_now)
    }

    fn live_string(&mut self, key: &str) -> Option<&String> {
        let now = self.now();
        let expired = matches!(
            self.strings.get(key),
            Some((_, Some(expires_at))) if *expires_at <= now
        );
        if expired {
            self.strings.remove(key);
        }
        self.strings.get(key).map(|(value, _)| value)
    }
}

fn system_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Queue store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Creates an empty store that follows the system clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store whose clock is pinned at `now` (epoch seconds).
    pub fn with_clock(now: f64) -> Self {
        let store = Self::default();
        store.set_time(now);
        store
    }

    /// Pins the clock at `now`.
    pub fn set_time(&self, now: f64) {
        self.lock().clock = Some(now);
    }

    /// Moves the clock forward, pinning it first if it was following the system clock.
    pub fn advance(&self, by: Duration) {
        let mut state = self.lock();
        let now = state.now();
        state.clock = Some(now + by.as_secs_f64());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-operation; the data
        // is still consistent per operation.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn push(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn push_all(&self, key: &str, values: &[String]) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }
        self.lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .extend(values.iter().cloned());
        Ok(())
    }

    async fn pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut state = self.lock();
        let value = state.lists.get_mut(key).and_then(|list| list.pop_front());
        if state.lists.get(key).is_some_and(|list| list.is_empty()) {
            state.lists.remove(key);
        }
        Ok(value)
    }

    async fn move_head(&self, src: &str, dst: &str) -> Result<Option<String>, StoreError> {
        let mut state = self.lock();
        let Some(value) = state.lists.get_mut(src).and_then(|list| list.pop_front()) else {
            return Ok(None);
        };
        if state.lists.get(src).is_some_and(|list| list.is_empty()) {
            state.lists.remove(src);
        }
        state
            .lists
            .entry(dst.to_string())
            .or_default()
            .push_back(value.clone());
        Ok(Some(value))
    }

    async fn remove(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut state = self.lock();
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|entry| entry != value);
        let removed = before - list.len();
        if list.is_empty() {
            state.lists.remove(key);
        }
        Ok(removed)
    }

    async fn range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn len(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.lock().lists.get(key).map_or(0, VecDeque::len))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_set_many(
        &self,
        key: &str,
        fields: &[(&str, String)],
    ) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut state = self.lock();
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut state = self.lock();
        let hash = state.hashes.entry(key.to_string()).or_default();
        let current = match hash.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::UnexpectedValue {
                key: format!("{}.{}", key, field),
                message: format!("hash value '{}' is not an integer", raw),
            })?,
            None => 0,
        };
        let updated = current + delta;
        hash.insert(field.to_string(), updated.to_string());
        Ok(updated)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(hash) = state.hashes.get_mut(key) {
            hash.remove(field);
            if hash.is_empty() {
                state.hashes.remove(key);
            }
        }
        Ok(())
    }

    async fn hash_compare_and_swap(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        new: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(hash) = state.hashes.get_mut(key) else {
            return Ok(false);
        };
        if hash.get(field).map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        match new {
            Some(value) => {
                hash.insert(field.to_string(), value.to_string());
            }
            None => {
                hash.remove(field);
                if hash.is_empty() {
                    state.hashes.remove(key);
                }
            }
        }
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().live_string(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock()
            .strings
            .insert(key.to_string(), (value.to_string(), None));
        Ok(())
    }

    async fn delete(&self, keys: &[&str]) -> Result<(), StoreError> {
        let mut state = self.lock();
        for key in keys {
            state.lists.remove(*key);
            state.hashes.remove(*key);
            state.strings.remove(*key);
        }
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if state.live_string(key).is_some() {
            return Ok(false);
        }
        let expires_at = state.now() + ttl.as_secs_f64();
        state
            .strings
            .insert(key.to_string(), (value.to_string(), Some(expires_at)));
        Ok(true)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if state.live_string(key).map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        let expires_at = state.now() + ttl.as_secs_f64();
        if let Some(entry) = state.strings.get_mut(key) {
            entry.1 = Some(expires_at);
        }
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if state.live_string(key).map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        state.strings.remove(key);
        Ok(true)
    }

    async fn now(&self) -> Result<f64, StoreError> {
        Ok(self.lock().now())
    }
}
