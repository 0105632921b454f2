//! # Recent-Message Cache
//!
//! Cache-aside storage of each channel's recent messages, most recent first,
//! under `channel:messages:<channel_id>`.
//!
//! Reads go through an atomic exists-and-refresh script, so a live entry is
//! never reported missing and every hit extends its TTL. On a miss exactly one
//! caller per channel rebuilds the entry from the system of record: it takes
//! `lock:<channel_id>`, re-checks the cache, runs the loader and writes the
//! result back. Callers that lose the lock race wait once for `lock_wait` and
//! read again; if the entry is still missing they get
//! [`CacheError::Contended`] and are expected to retry later.
//!
//! A rebuild replaces the whole list. A message pushed between the loader's
//! query and the write-back can therefore be dropped from the cache until the
//! next write or rebuild; the system of record still has it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use super::lock::{DistributedLock, LockError};
use super::registry::BoxError;
use crate::connections::kv_store::{KvStore, StoreError};
use crate::models::ChannelMessage;

/// Errors raised by the cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("failed to encode message for cache: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("loading recent messages for channel '{channel_id}' failed: {source}")]
    Load { channel_id: String, source: BoxError },

    #[error("channel '{0}' is being rebuilt by another caller, retry later")]
    Contended(String),
}

/// Tunables of the cache.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Lifetime of an entry, refreshed on every read and write.
    pub ttl: Duration,
    /// Upper bound on how long a rebuild may hold the lock.
    pub lock_ttl: Duration,
    /// Backoff before the single re-read after losing the lock race.
    pub lock_wait: Duration,
    /// Maximum entries kept per channel (0 = unbounded).
    pub max_messages: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            lock_ttl: Duration::from_secs(10),
            lock_wait: Duration::from_millis(300),
            max_messages: 200,
        }
    }
}

/// Cache key of a channel's recent messages.
pub fn messages_key(channel_id: &str) -> String {
    format!("channel:messages:{channel_id}")
}

/// Lock key guarding a channel's rebuild.
pub fn lock_key(channel_id: &str) -> String {
    format!("lock:{channel_id}")
}

/// The per-channel recent-message cache.
#[derive(Clone)]
pub struct MessageCache {
    store: Arc<dyn KvStore>,
    settings: CacheSettings,
}

impl MessageCache {
    pub fn new(store: Arc<dyn KvStore>, settings: CacheSettings) -> Self {
        Self { store, settings }
    }

    /// Returns the recent messages of `channel_id`, most recent first.
    ///
    /// `on_miss` loads the list from the system of record and must return it
    /// most recent first. It runs at most once across all concurrent callers
    /// for the same channel while the lock is held. Its error is returned
    /// as [`CacheError::Load`] and nothing is cached. An empty result is
    /// returned but not cached.
    pub async fn get_recent<F, Fut>(&self, channel_id: &str, on_miss: F) -> Result<Vec<ChannelMessage>, CacheError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Vec<ChannelMessage>, BoxError>>,
    {
        let key = messages_key(channel_id);
        if let Some(messages) = self.read(&key, channel_id).await? {
            return Ok(messages);
        }

        let lock = DistributedLock::new(Arc::clone(&self.store), lock_key(channel_id), self.settings.lock_ttl);
        let Some(guard) = lock.try_acquire().await? else {
            debug!(channel_id, "cache rebuild in progress elsewhere, waiting");
            tokio::time::sleep(self.settings.lock_wait).await;
            return match self.read(&key, channel_id).await? {
                Some(messages) => Ok(messages),
                None => Err(CacheError::Contended(channel_id.to_string())),
            };
        };

        let rebuilt = self.rebuild(&key, channel_id, on_miss).await;
        if let Err(error) = guard.release().await {
            warn!(channel_id, %error, "failed to release cache rebuild lock");
        }
        rebuilt
    }

    /// Prepends `message` to its channel's entry, creating the entry if it
    /// does not exist, and refreshes the TTL.
    pub async fn push_message(&self, message: &ChannelMessage) -> Result<(), CacheError> {
        let entry = message.to_entry()?;
        self.store
            .prepend_list(
                &messages_key(&message.channel_id),
                entry,
                self.settings.ttl,
                self.settings.max_messages,
            )
            .await?;
        Ok(())
    }

    async fn rebuild<F, Fut>(&self, key: &str, channel_id: &str, on_miss: F) -> Result<Vec<ChannelMessage>, CacheError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Vec<ChannelMessage>, BoxError>>,
    {
        // The previous holder may have finished between our miss and our acquire.
        if let Some(messages) = self.read(key, channel_id).await? {
            return Ok(messages);
        }

        let messages = on_miss(channel_id.to_string())
            .await
            .map_err(|source| CacheError::Load {
                channel_id: channel_id.to_string(),
                source,
            })?;

        if messages.is_empty() {
            debug!(channel_id, "system of record has no messages, nothing cached");
            return Ok(messages);
        }

        let entries = messages
            .iter()
            .map(ChannelMessage::to_entry)
            .collect::<Result<Vec<_>, _>>()?;
        self.store
            .replace_list(key, entries, self.settings.ttl, self.settings.max_messages)
            .await?;
        debug!(channel_id, count = messages.len(), "cache entry rebuilt");
        Ok(messages)
    }

    async fn read(&self, key: &str, channel_id: &str) -> Result<Option<Vec<ChannelMessage>>, CacheError> {
        let Some(entries) = self.store.read_list_refresh(key, self.settings.ttl).await? else {
            return Ok(None);
        };
        let messages = entries
            .iter()
            .filter_map(|entry| match ChannelMessage::from_entry(entry) {
                Ok(message) => Some(message),
                Err(error) => {
                    warn!(channel_id, %error, "skipping undecodable cache entry");
                    None
                }
            })
            .collect();
        Ok(Some(messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::memory_store::MemoryStore;

    fn message(id: &str, channel: &str, at: i64) -> ChannelMessage {
        ChannelMessage {
            message_id: id.to_string(),
            channel_id: channel.to_string(),
            sender_id: "u1".to_string(),
            content: format!("body of {id}"),
            created_at: at,
        }
    }

    async fn must_not_load(_channel_id: String) -> Result<Vec<ChannelMessage>, BoxError> {
        panic!("loader must not run");
    }

    fn cache(store: &Arc<MemoryStore>) -> MessageCache {
        MessageCache::new(Arc::clone(store) as Arc<dyn KvStore>, CacheSettings::default())
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(messages_key("c9"), "channel:messages:c9");
        assert_eq!(lock_key("c9"), "lock:c9");
    }

    #[tokio::test]
    async fn test_loader_error_is_not_cached() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache(&store);

        let err = cache
            .get_recent("c1", |_| async { Err::<Vec<ChannelMessage>, BoxError>("db down".into()) })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Load { ref channel_id, .. } if channel_id == "c1"));
        assert!(!store.contains_key(&messages_key("c1")));
        assert!(!store.contains_key(&lock_key("c1")));
    }

    #[tokio::test]
    async fn test_empty_result_is_not_cached() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache(&store);

        let got = cache.get_recent("c1", |_| async { Ok::<_, BoxError>(Vec::new()) }).await.unwrap();
        assert!(got.is_empty());
        assert!(!store.contains_key(&messages_key("c1")));
    }

    #[tokio::test]
    async fn test_push_creates_then_prepends() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache(&store);

        cache.push_message(&message("m1", "c1", 1)).await.unwrap();
        cache.push_message(&message("m2", "c1", 2)).await.unwrap();

        let got = cache
            .get_recent("c1", must_not_load)
            .await
            .unwrap();
        let ids: Vec<_> = got.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, ["m2", "m1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gives_up_after_one_retry() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache(&store);
        store.set_text(&lock_key("c1"), "other-holder", Some(Duration::from_secs(10)));

        let started = tokio::time::Instant::now();
        let err = cache
            .get_recent("c1", must_not_load)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Contended(ref c) if c == "c1"));
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_corrupt_entries_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache(&store);
        let good = message("m1", "c1", 1).to_entry().unwrap();
        store
            .replace_list(&messages_key("c1"), vec!["{broken".to_string(), good], Duration::from_secs(60), 0)
            .await
            .unwrap();

        let got = cache
            .get_recent("c1", must_not_load)
            .await
            .unwrap();
        assert_eq!(got, vec![message("m1", "c1", 1)]);
    }
}
