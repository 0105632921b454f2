//! # Redis Cache Implementation
//!
//! Provides the asynchronous Redis backend for [`KvStore`]. Existence checks,
//! TTL refreshes and token-checked deletes run as server-side Lua scripts so
//! that no other client can interleave between the check and the mutation.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};

use super::kv_store::{KvStore, StoreError, StoreResult};

// KEYS[1]: list key. ARGV[1]: ttl in seconds.
const READ_REFRESH_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 0 then
    return false
end
redis.call("EXPIRE", KEYS[1], ARGV[1])
return redis.call("LRANGE", KEYS[1], 0, -1)
"#;

// KEYS[1]: list key. ARGV[1]: ttl in seconds. ARGV[2]: max length (0 = unbounded). ARGV[3]: entry.
const PREPEND_SCRIPT: &str = r#"
redis.call("LPUSH", KEYS[1], ARGV[3])
local max_len = tonumber(ARGV[2])
if max_len > 0 then
    redis.call("LTRIM", KEYS[1], 0, max_len - 1)
end
redis.call("EXPIRE", KEYS[1], ARGV[1])
return 1
"#;

// KEYS[1]: list key. ARGV[1]: ttl in seconds. ARGV[2]: max length. ARGV[3..]: entries, head first.
const REPLACE_SCRIPT: &str = r#"
redis.call("DEL", KEYS[1])
if #ARGV < 3 then
    return 0
end
for i = 3, #ARGV do
    redis.call("RPUSH", KEYS[1], ARGV[i])
end
local max_len = tonumber(ARGV[2])
if max_len > 0 then
    redis.call("LTRIM", KEYS[1], 0, max_len - 1)
end
redis.call("EXPIRE", KEYS[1], ARGV[1])
return 1
"#;

// KEYS[1]: lock key. ARGV[1]: expected token.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// A Redis-backed [`KvStore`].
///
/// Wraps a [`ConnectionManager`], which multiplexes commands over one
/// connection and reconnects transparently. Every operation is bounded by
/// `op_timeout`.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    op_timeout: Duration,
    read_refresh: Script,
    prepend: Script,
    replace: Script,
    release: Script,
}

impl RedisStore {
    /// Connects to Redis and verifies the connection with a `PING`.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://:password@127.0.0.1:6379/0").
    /// * `op_timeout` - Upper bound for every single store operation.
    pub async fn connect(url: &str, op_timeout: Duration) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let mut conn = client.get_connection_manager().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self {
            conn,
            op_timeout,
            read_refresh: Script::new(READ_REFRESH_SCRIPT),
            prepend: Script::new(PREPEND_SCRIPT),
            replace: Script::new(REPLACE_SCRIPT),
            release: Script::new(RELEASE_LOCK_SCRIPT),
        })
    }

    async fn bounded<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl KvStore for RedisStore {
    async fn read_list_refresh(&self, key: &str, ttl: Duration) -> StoreResult<Option<Vec<String>>> {
        let mut conn = self.conn.clone();
        let mut invocation = self.read_refresh.key(key);
        invocation.arg(ttl_secs(ttl));
        self.bounded(invocation.invoke_async(&mut conn)).await
    }

    async fn prepend_list(&self, key: &str, value: String, ttl: Duration, max_len: usize) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut invocation = self.prepend.key(key);
        invocation.arg(ttl_secs(ttl)).arg(max_len).arg(value);
        let _: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(())
    }

    async fn replace_list(&self, key: &str, values: Vec<String>, ttl: Duration, max_len: usize) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut invocation = self.replace.key(key);
        invocation.arg(ttl_secs(ttl)).arg(max_len).arg(values);
        let _: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(token).arg("NX").arg("PX").arg(ttl_ms);
        let reply: Option<String> = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(reply.is_some())
    }

    async fn release_lock(&self, key: &str, token: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.release.key(key);
        invocation.arg(token);
        let deleted: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(deleted == 1)
    }

    async fn hash_get_many(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key).arg(fields);
        self.bounded(cmd.query_async(&mut conn)).await
    }
}
