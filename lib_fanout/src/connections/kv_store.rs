//! # Key-Value Store Contract
//!
//! The narrow set of key-value operations the fan-out tier relies on. Every
//! method maps to one round trip that the server executes atomically: a Lua
//! script, a conditional `SET`, or a batched hash read.
//!
//! Two implementations exist: [`RedisStore`](super::cache_redis::RedisStore)
//! for production and [`MemoryStore`](super::memory_store::MemoryStore) for
//! tests and local runs.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a key-value backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("key-value operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("key '{0}' holds a value of the wrong type")]
    WrongType(String),
}

/// Result alias for key-value operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Atomic key-value operations used by the cache, the lock and the router.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Reads the whole list at `key` and refreshes its TTL, atomically.
    ///
    /// Returns `None` when the key does not exist. A present key is never
    /// reported missing and a missing key is never resurrected.
    async fn read_list_refresh(&self, key: &str, ttl: Duration) -> StoreResult<Option<Vec<String>>>;

    /// Prepends `value`, trims the list to `max_len` entries (0 = unbounded)
    /// and sets the TTL. Creates the list if it does not exist.
    async fn prepend_list(&self, key: &str, value: String, ttl: Duration, max_len: usize) -> StoreResult<()>;

    /// Replaces the list at `key` with `values` in the given order and sets
    /// the TTL. An empty `values` leaves the key absent.
    async fn replace_list(&self, key: &str, values: Vec<String>, ttl: Duration, max_len: usize) -> StoreResult<()>;

    /// `SET key token NX PX ttl`. Returns `true` when the lock was taken.
    async fn acquire_lock(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool>;

    /// Deletes `key` only if it still holds `token`. Returns `true` on delete.
    async fn release_lock(&self, key: &str, token: &str) -> StoreResult<bool>;

    /// `HMGET key fields...`, one slot per requested field.
    async fn hash_get_many(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>>;
}
