//! # Channel Message
//!
//! The immutable record that flows from the message-creation path through the
//! bus, the recent-history cache and the dispatch pipeline. The JSON form is
//! the bus payload and the cache entry format.

use serde::{Deserialize, Serialize};

/// A single chat message posted to a channel.
///
/// Once created a message is never mutated. Older producers emitted `id` and
/// `user_id` instead of `message_id` and `sender_id`; both spellings decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Globally unique identifier (`message_<uuid>`).
    #[serde(alias = "id")]
    pub message_id: String,
    /// The channel the message was posted to.
    pub channel_id: String,
    /// The user who posted the message.
    #[serde(alias = "user_id")]
    pub sender_id: String,
    /// Message body.
    pub content: String,
    /// Creation time in Unix seconds.
    pub created_at: i64,
}

impl ChannelMessage {
    /// Creates a message stamped with a fresh identifier and the current time.
    pub fn new(channel_id: &str, sender_id: &str, content: &str) -> Self {
        Self {
            message_id: format!("message_{}", uuid::Uuid::new_v4().simple()),
            channel_id: channel_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Decodes a bus payload.
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Encodes the message for the bus.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Encodes the message as a cache list entry.
    pub fn to_entry(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a cache list entry.
    pub fn from_entry(entry: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(entry)
    }
}
