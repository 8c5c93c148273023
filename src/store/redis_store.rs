//! Redis implementation of the queue store.
//!
//! Lists map to Redis lists (`RPUSH`/`LPOP`/`LMOVE`), hashes to Redis hashes
//! and scalar blobs to plain string keys. The compare-and-swap operations are
//! Lua scripts so they execute atomically on the server.
//!
//! Every operation runs through the store's [`RetryPolicy`]: transient
//! connection errors are retried with exponential backoff and each attempt
//! is bounded by a timeout, so a network partition surfaces as an error
//! instead of hanging the coordinator.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::retry::RetryPolicy;
use super::QueueStore;
use crate::error::StoreError;

const HASH_CAS_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
    if ARGV[3] == '1' then
        redis.call('HSET', KEYS[1], ARGV[1], ARGV[4])
    else
        redis.call('HDEL', KEYS[1], ARGV[1])
    end
    return 1
end
return 0
"#;

const COMPARE_AND_EXPIRE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Queue store backed by Redis.
///
/// The connection manager reconnects on its own; it is cheap to clone, so
/// each operation works on its own handle.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    policy: RetryPolicy,
    hash_cas: Script,
    compare_and_expire: Script,
    compare_and_delete: Script,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `policy` - Retry and timeout policy applied to every operation
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, policy: RetryPolicy) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = tokio::time::timeout(policy.op_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                StoreError::ConnectionFailed(format!(
                    "timed out after {:?} connecting to {}",
                    policy.op_timeout, redis_url
                ))
            })?
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, policy))
    }

    /// Wraps an existing connection manager.
    pub fn from_connection(redis: ConnectionManager, policy: RetryPolicy) -> Self {
        Self {
            redis,
            policy,
            hash_cas: Script::new(HASH_CAS_SCRIPT),
            compare_and_expire: Script::new(COMPARE_AND_EXPIRE_SCRIPT),
            compare_and_delete: Script::new(COMPARE_AND_DELETE_SCRIPT),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn push(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.policy
            .run("rpush", || {
                let mut conn = self.redis.clone();
                async move {
                    let _: usize = conn.rpush(key, value).await?;
                    Ok(())
                }
            })
            .await
    }

    async fn push_all(&self, key: &str, values: &[String]) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }

        // MULTI/EXEC: readers never observe a half-seeded queue.
        self.policy
            .run("rpush_pipeline", || {
                let mut conn = self.redis.clone();
                async move {
                    let mut pipe = redis::pipe();
                    pipe.atomic();
                    for value in values {
                        pipe.rpush(key, value).ignore();
                    }
                    pipe.query_async::<_, ()>(&mut conn).await?;
                    Ok(())
                }
            })
            .await
    }

    async fn pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.policy
            .run("lpop", || {
                let mut conn = self.redis.clone();
                async move {
                    let value: Option<String> = conn.lpop(key, None).await?;
                    Ok(value)
                }
            })
            .await
    }

    async fn move_head(&self, src: &str, dst: &str) -> Result<Option<String>, StoreError> {
        self.policy
            .run("lmove", || {
                let mut conn = self.redis.clone();
                async move {
                    let value: Option<String> = redis::cmd("LMOVE")
                        .arg(src)
                        .arg(dst)
                        .arg("LEFT")
                        .arg("RIGHT")
                        .query_async(&mut conn)
                        .await?;
                    Ok(value)
                }
            })
            .await
    }

    async fn remove(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        self.policy
            .run("lrem", || {
                let mut conn = self.redis.clone();
                async move {
                    let removed: usize = conn.lrem(key, 0, value).await?;
                    Ok(removed)
                }
            })
            .await
    }

    async fn range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.policy
            .run("lrange", || {
                let mut conn = self.redis.clone();
                async move {
                    let values: Vec<String> = conn.lrange(key, 0, -1).await?;
                    Ok(values)
                }
            })
            .await
    }

    async fn len(&self, key: &str) -> Result<usize, StoreError> {
        self.policy
            .run("llen", || {
                let mut conn = self.redis.clone();
                async move {
                    let len: usize = conn.llen(key).await?;
                    Ok(len)
                }
            })
            .await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.policy
            .run("hset", || {
                let mut conn = self.redis.clone();
                async move {
                    let _: usize = conn.hset(key, field, value).await?;
                    Ok(())
                }
            })
            .await
    }

    async fn hash_set_many(
        &self,
        key: &str,
        fields: &[(&str, String)],
    ) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }

        self.policy
            .run("hset_multiple", || {
                let mut conn = self.redis.clone();
                async move {
                    let _: () = conn.hset_multiple(key, fields).await?;
                    Ok(())
                }
            })
            .await
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.policy
            .run("hget", || {
                let mut conn = self.redis.clone();
                async move {
                    let value: Option<String> = conn.hget(key, field).await?;
                    Ok(value)
                }
            })
            .await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.policy
            .run("hgetall", || {
                let mut conn = self.redis.clone();
                async move {
                    let map: HashMap<String, String> = conn.hgetall(key).await?;
                    Ok(map)
                }
            })
            .await
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        self.policy
            .run("hincrby", || {
                let mut conn = self.redis.clone();
                async move {
                    let value: i64 = conn.hincr(key, field, delta).await?;
                    Ok(value)
                }
            })
            .await
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<(), StoreError> {
        self.policy
            .run("hdel", || {
                let mut conn = self.redis.clone();
                async move {
                    let _: usize = conn.hdel(key, field).await?;
                    Ok(())
                }
            })
            .await
    }

    async fn hash_compare_and_swap(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        new: Option<&str>,
    ) -> Result<bool, StoreError> {
        let (replace, new_value) = match new {
            Some(value) => ("1", value),
            None => ("0", ""),
        };

        self.policy
            .run("hash_cas", || {
                let mut conn = self.redis.clone();
                async move {
                    let swapped: i64 = self
                        .hash_cas
                        .key(key)
                        .arg(field)
                        .arg(expected)
                        .arg(replace)
                        .arg(new_value)
                        .invoke_async(&mut conn)
                        .await?;
                    Ok(swapped == 1)
                }
            })
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.policy
            .run("get", || {
                let mut conn = self.redis.clone();
                async move {
                    let value: Option<String> = conn.get(key).await?;
                    Ok(value)
                }
            })
            .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.policy
            .run("set", || {
                let mut conn = self.redis.clone();
                async move {
                    let _: () = conn.set(key, value).await?;
                    Ok(())
                }
            })
            .await
    }

    async fn delete(&self, keys: &[&str]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }

        self.policy
            .run("del", || {
                let mut conn = self.redis.clone();
                let keys = keys.to_vec();
                async move {
                    let _: usize = conn.del(keys).await?;
                    Ok(())
                }
            })
            .await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.policy
            .run("set_nx", || {
                let mut conn = self.redis.clone();
                async move {
                    let reply: Option<String> = redis::cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("NX")
                        .arg("PX")
                        .arg(ttl_millis(ttl))
                        .query_async(&mut conn)
                        .await?;
                    Ok(reply.is_some())
                }
            })
            .await
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.policy
            .run("compare_and_expire", || {
                let mut conn = self.redis.clone();
                async move {
                    let renewed: i64 = self
                        .compare_and_expire
                        .key(key)
                        .arg(expected)
                        .arg(ttl_millis(ttl))
                        .invoke_async(&mut conn)
                        .await?;
                    Ok(renewed == 1)
                }
            })
            .await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.policy
            .run("compare_and_delete", || {
                let mut conn = self.redis.clone();
                async move {
                    let deleted: i64 = self
                        .compare_and_delete
                        .key(key)
                        .arg(expected)
                        .invoke_async(&mut conn)
                        .await?;
                    Ok(deleted == 1)
                }
            })
            .await
    }

    async fn now(&self) -> Result<f64, StoreError> {
        self.policy
            .run("time", || {
                let mut conn = self.redis.clone();
                async move {
                    let (secs, micros): (u64, u64) =
                        redis::cmd("TIME").query_async(&mut conn).await?;
                    Ok(secs as f64 + micros as f64 / 1_000_000.0)
                }
            })
            .await
    }
}
