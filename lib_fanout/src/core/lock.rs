//! # Distributed Lock
//!
//! A best-effort mutual-exclusion lock held in the shared key-value store.
//! Acquisition is a `SET NX PX` with a random per-attempt token; release is a
//! script that deletes the key only while it still holds that token, so a
//! holder whose TTL already lapsed can never free a later holder's lock.
//!
//! [`LockGuard`] releases on every exit path: explicitly through
//! [`LockGuard::release`], or from `Drop` on a spawned task when the guard is
//! dropped without it (early return, `?`, panic unwinding).

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::connections::kv_store::{KvStore, StoreError};

/// Errors raised by the lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock store error: {0}")]
    Store(#[from] StoreError),
}

/// A named lock in the shared store.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KvStore>,
    key: String,
    ttl: Duration,
}

impl DistributedLock {
    /// Creates a lock on `key` whose hold expires after `ttl`.
    pub fn new(store: Arc<dyn KvStore>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            ttl,
        }
    }

    /// Tries once to take the lock. `Ok(None)` means someone else holds it.
    pub async fn try_acquire(&self) -> Result<Option<LockGuard>, LockError> {
        let token = new_token();
        if self.store.acquire_lock(&self.key, &token, self.ttl).await? {
            debug!(key = %self.key, "lock acquired");
            Ok(Some(LockGuard {
                store: Arc::clone(&self.store),
                key: self.key.clone(),
                token,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }
}

fn new_token() -> String {
    format!("{:016x}{:016x}", rand::random::<u64>(), rand::random::<u64>())
}

/// Proof of holding a [`DistributedLock`].
pub struct LockGuard {
    store: Arc<dyn KvStore>,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    /// The token stored under the lock key while this guard holds it.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Releases the lock. Returns `false` if the key no longer held this
    /// guard's token (the TTL lapsed and it may belong to someone else now).
    pub async fn release(mut self) -> Result<bool, LockError> {
        self.released = true;
        let deleted = self.store.release_lock(&self.key, &self.token).await?;
        if !deleted {
            warn!(key = %self.key, "lock expired before release");
        }
        Ok(deleted)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "lock guard dropped outside a runtime, leaving it to expire");
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        runtime.spawn(async move {
            if let Err(error) = store.release_lock(&key, &token).await {
                warn!(%key, %error, "deferred lock release failed");
            }
        });
    }
}
