//! # Message Bus (NATS)
//!
//! Publish/subscribe access to the shared message bus. The dispatcher holds a
//! queue-group subscription so that replicas share the stream instead of each
//! receiving every message; the message service only publishes.
//!
//! The pipeline talks to the bus through [`BusSubscription`] and
//! [`BusPublisher`] so that it can be driven by in-process fakes in tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised by the bus adapter.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to connect to bus at {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("failed to subscribe to '{subject}': {reason}")]
    Subscribe { subject: String, reason: String },

    #[error("failed to publish to '{subject}': {reason}")]
    Publish { subject: String, reason: String },

    #[error("failed to unsubscribe: {0}")]
    Unsubscribe(String),

    #[error("failed to flush bus connection: {0}")]
    Flush(String),
}

/// A live subscription yielding raw payloads.
#[async_trait]
pub trait BusSubscription: Send {
    /// Waits for the next payload. `None` means the subscription has ended.
    async fn next_payload(&mut self) -> Option<Bytes>;

    /// Stops the subscription. Messages not yet received are left to the
    /// other members of the queue group.
    async fn unsubscribe(&mut self) -> Result<(), BusError>;
}

/// The publishing half of the bus.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Publishes `payload` on `subject`.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;
}

/// A connection to a NATS server.
#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    /// Connects to the NATS server at `url`.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = async_nats::connect(url).await.map_err(|e| BusError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        info!(url, "connected to message bus");
        Ok(Self { client })
    }

    /// Joins `queue_group` on `subject`.
    pub async fn queue_subscribe(&self, subject: &str, queue_group: &str) -> Result<NatsSubscription, BusError> {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), queue_group.to_string())
            .await
            .map_err(|e| BusError::Subscribe {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?;
        info!(subject, queue_group, "joined bus queue group");
        Ok(NatsSubscription { subscriber })
    }

    /// Flushes buffered outbound messages to the server.
    pub async fn flush(&self) -> Result<(), BusError> {
        self.client.flush().await.map_err(|e| BusError::Flush(e.to_string()))
    }
}

#[async_trait]
impl BusPublisher for NatsBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BusError::Publish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })
    }
}

/// A queue-group subscription on a NATS subject.
pub struct NatsSubscription {
    subscriber: async_nats::Subscriber,
}

#[async_trait]
impl BusSubscription for NatsSubscription {
    async fn next_payload(&mut self) -> Option<Bytes> {
        let message = self.subscriber.next().await?;
        debug!(subject = %message.subject, bytes = message.payload.len(), "bus message received");
        Some(message.payload)
    }

    async fn unsubscribe(&mut self) -> Result<(), BusError> {
        self.subscriber
            .unsubscribe()
            .await
            .map_err(|e| BusError::Unsubscribe(e.to_string()))
    }
}
