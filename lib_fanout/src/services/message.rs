//! # Message Service
//!
//! The write and read paths behind the message HTTP API.
//!
//! Creating a message publishes it on the bus (the dispatcher fans it out),
//! prepends it to the channel's cached history and persists it to the system
//! of record in the background. Reading recent history goes through the
//! cache-aside [`MessageCache`], loading from the repository on a miss. Older
//! pages, addressed by a `created_at` cursor, bypass the cache.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::connections::bus_nats::{BusError, BusPublisher};
use crate::connections::db_postgres::{MessageRepository, RepoError};
use crate::core::message_cache::{CacheError, MessageCache};
use crate::core::registry::BoxError;
use crate::models::ChannelMessage;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("failed to read message history: {0}")]
    Repository(#[from] RepoError),
}

/// Creates and lists channel messages.
pub struct MessageService {
    cache: MessageCache,
    repo: Arc<dyn MessageRepository>,
    publisher: Arc<dyn BusPublisher>,
    subject: String,
    history_limit: usize,
    pending_writes: TaskTracker,
}

impl MessageService {
    /// # Arguments
    /// * `cache` - Recent-history cache.
    /// * `repo` - System of record.
    /// * `publisher` - Bus the dispatcher consumes from.
    /// * `subject` - Subject new messages are published on.
    /// * `history_limit` - Rows loaded from the repository on a cache miss.
    pub fn new(
        cache: MessageCache,
        repo: Arc<dyn MessageRepository>,
        publisher: Arc<dyn BusPublisher>,
        subject: impl Into<String>,
        history_limit: usize,
    ) -> Self {
        Self {
            cache,
            repo,
            publisher,
            subject: subject.into(),
            history_limit,
            pending_writes: TaskTracker::new(),
        }
    }

    /// Creates a message and returns it.
    ///
    /// Fails only when the request is invalid or the bus rejects the
    /// publish. A cache write failure is logged; the next cache rebuild
    /// picks the message up from the repository.
    pub async fn create_message(&self, channel_id: &str, sender_id: &str, content: &str) -> Result<ChannelMessage, ServiceError> {
        for (field, value) in [("channel_id", channel_id), ("sender_id", sender_id), ("content", content)] {
            if value.trim().is_empty() {
                return Err(ServiceError::Validation(format!("{field} must not be empty")));
            }
        }

        let message = ChannelMessage::new(channel_id, sender_id, content);
        let payload = Bytes::from(message.encode()?);
        self.publisher.publish(&self.subject, payload).await?;
        debug!(message_id = %message.message_id, channel_id, "message published");

        if let Err(error) = self.cache.push_message(&message).await {
            warn!(message_id = %message.message_id, channel_id, %error, "failed to push message into cache");
        }

        let repo = Arc::clone(&self.repo);
        let record = message.clone();
        self.pending_writes.spawn(async move {
            if let Err(error) = repo.insert(&record).await {
                error!(
                    message_id = %record.message_id,
                    channel_id = %record.channel_id,
                    user_id = %record.sender_id,
                    %error,
                    "failed to persist message"
                );
            }
        });

        Ok(message)
    }

    /// Returns the recent messages of `channel_id`, most recent first.
    pub async fn recent_messages(&self, channel_id: &str) -> Result<Vec<ChannelMessage>, ServiceError> {
        if channel_id.trim().is_empty() {
            return Err(ServiceError::Validation("channel_id must not be empty".to_string()));
        }

        let repo = Arc::clone(&self.repo);
        let limit = self.history_limit;
        let messages = self
            .cache
            .get_recent(channel_id, move |channel_id| async move {
                repo.recent_for_channel(&channel_id, limit)
                    .await
                    .map_err(|e| Box::new(e) as BoxError)
            })
            .await?;
        Ok(messages)
    }

    /// Returns one page of `channel_id`'s history, most recent first.
    ///
    /// Without a cursor the page is the head of the cached recent history.
    /// With `before` (unix seconds) it holds the messages created strictly
    /// earlier, read from the repository. `limit` defaults to, and may not
    /// exceed, the cached history length.
    pub async fn history_page(
        &self,
        channel_id: &str,
        before: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<ChannelMessage>, ServiceError> {
        let limit = limit.unwrap_or(self.history_limit);
        if limit == 0 || limit > self.history_limit {
            return Err(ServiceError::Validation(format!(
                "limit must be between 1 and {}",
                self.history_limit
            )));
        }

        let Some(before) = before else {
            let mut messages = self.recent_messages(channel_id).await?;
            messages.truncate(limit);
            return Ok(messages);
        };

        if channel_id.trim().is_empty() {
            return Err(ServiceError::Validation("channel_id must not be empty".to_string()));
        }
        Ok(self.repo.messages_before(channel_id, before, limit).await?)
    }

    /// Stops accepting background writes and waits up to `grace` for the
    /// pending ones. Returns `false` if some were still running.
    pub async fn flush_writes(&self, grace: Duration) -> bool {
        self.pending_writes.close();
        let drained = tokio::time::timeout(grace, self.pending_writes.wait()).await.is_ok();
        if drained {
            info!("pending message writes flushed");
        } else {
            warn!(pending = self.pending_writes.len(), "gave up waiting for pending message writes");
        }
        drained
    }
}
