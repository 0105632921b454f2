//! # Fan-out Dispatcher
//!
//! Consumes channel messages from the bus and delivers each one to every
//! member of its channel who currently holds a live connection.
//!
//! ## Pipeline, per message
//!
//! 1.  **Decode**: the payload is parsed as a [`ChannelMessage`]. A payload
//!     that does not parse is logged and dropped. It is never retried.
//!
//! 2.  **Membership**: one channel-directory instance is picked from the
//!     directory [`RoutingTable`] and asked for the member list under the RPC
//!     timeout. Any failure here abandons the message; the bus has already
//!     handed it over and will not redeliver it.
//!
//! 3.  **Routing**: the routing token of every member is read in a single
//!     `HMGET` on the connection-routing hash. Members without a token are
//!     offline and skipped.
//!
//! 4.  **Fan-out**: each token names a connector instance in the connector
//!     [`RoutingTable`]. One delivery task per recipient is submitted to the
//!     shared [`WorkerPool`]; submission waits while the pool is full, which
//!     slows the consumer loop down instead of queueing without bound.
//!
//! 5.  **Delivery**: each task performs one bounded outbound RPC. A failure is
//!     logged and ends that task only. A connector that reports itself
//!     unavailable is evicted until the next registry refresh.
//!
//! Delivery is best effort and at most once per recipient. Nothing is
//! reported back to the producer.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::balancer::{RoutingError, RoutingTable};
use super::worker_pool::{PoolError, WorkerPool};
use crate::connections::bus_nats::BusSubscription;
use crate::connections::kv_store::{KvStore, StoreError};
use crate::models::ChannelMessage;
use crate::rpc::{ConnectorHandle, DirectoryHandle, RpcError};

/// Why a message was abandoned.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("undecodable message payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("no route to the channel directory: {0}")]
    Routing(#[from] RoutingError),

    #[error("listing members of channel '{channel_id}' failed: {source}")]
    Membership { channel_id: String, source: RpcError },

    #[error("listing members of channel '{channel_id}' timed out after {timeout:?}")]
    MembershipTimeout { channel_id: String, timeout: Duration },

    #[error("connection routing lookup failed: {0}")]
    Routes(#[from] StoreError),

    #[error("delivery could not be scheduled: {0}")]
    Pool(#[from] PoolError),
}

/// Tunables of the pipeline.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Deadline of every outbound RPC.
    pub rpc_timeout: Duration,
    /// Hash mapping user id to connector routing token.
    pub routing_hash_key: String,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(2),
            routing_hash_key: "user:connectors".to_string(),
        }
    }
}

/// What happened to one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Members returned by the channel directory.
    pub members: usize,
    /// Members with no routing token.
    pub offline: usize,
    /// Members whose token names no known connector.
    pub unroutable: usize,
    /// Delivery tasks handed to the pool.
    pub submitted: usize,
}

/// The dispatch pipeline of one process.
pub struct Dispatcher {
    directory: Arc<RoutingTable<DirectoryHandle>>,
    connectors: Arc<RoutingTable<ConnectorHandle>>,
    routes: Arc<dyn KvStore>,
    pool: Arc<WorkerPool>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        directory: Arc<RoutingTable<DirectoryHandle>>,
        connectors: Arc<RoutingTable<ConnectorHandle>>,
        routes: Arc<dyn KvStore>,
        pool: Arc<WorkerPool>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            directory,
            connectors,
            routes,
            pool,
            settings,
        }
    }

    /// Decodes a raw bus payload and dispatches it.
    pub async fn dispatch_payload(&self, payload: &[u8]) -> Result<DispatchReport, DispatchError> {
        let message = ChannelMessage::decode(payload)?;
        self.dispatch(Arc::new(message)).await
    }

    /// Resolves the recipients of `message` and submits one delivery each.
    ///
    /// Returns once every delivery has been handed to the pool, not when the
    /// deliveries finish.
    pub async fn dispatch(&self, message: Arc<ChannelMessage>) -> Result<DispatchReport, DispatchError> {
        let members = self.resolve_members(&message.channel_id).await?;
        let mut report = DispatchReport {
            members: members.len(),
            ..DispatchReport::default()
        };
        if members.is_empty() {
            return Ok(report);
        }

        let tokens = self
            .routes
            .hash_get_many(&self.settings.routing_hash_key, &members)
            .await?;

        for (user_id, token) in members.into_iter().zip(tokens) {
            let Some(token) = token.filter(|t| !t.is_empty()) else {
                warn!(channel_id = %message.channel_id, %user_id, "recipient offline, skipping");
                report.offline += 1;
                continue;
            };

            let connector = match self.connectors.get(&token) {
                Ok(connector) => connector,
                Err(error) => {
                    warn!(channel_id = %message.channel_id, %user_id, connector = %token, %error, "no connector for routing token");
                    report.unroutable += 1;
                    continue;
                }
            };

            let task = deliver(
                Arc::clone(&self.connectors),
                connector,
                token,
                user_id,
                Arc::clone(&message),
                self.settings.rpc_timeout,
            );
            self.pool.submit(task).await?;
            report.submitted += 1;
        }

        debug!(
            message_id = %message.message_id,
            channel_id = %message.channel_id,
            members = report.members,
            offline = report.offline,
            unroutable = report.unroutable,
            submitted = report.submitted,
            "message fanned out"
        );
        Ok(report)
    }

    /// Consumes `subscription` until `shutdown` fires or the subscription
    /// ends, then unsubscribes. Errors are logged, never returned.
    pub async fn run<S>(&self, subscription: &mut S, shutdown: CancellationToken)
    where
        S: BusSubscription + ?Sized,
    {
        info!("dispatch loop started");
        loop {
            let payload = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = subscription.next_payload() => match next {
                    Some(payload) => payload,
                    None => {
                        warn!("bus subscription closed");
                        break;
                    }
                },
            };

            match self.dispatch_payload(&payload).await {
                Ok(_) => {}
                Err(error @ DispatchError::Decode(_)) => {
                    error!(%error, bytes = payload.len(), "dropping malformed bus message");
                }
                Err(error) => {
                    error!(%error, "message dispatch abandoned");
                }
            }
        }

        if let Err(error) = subscription.unsubscribe().await {
            warn!(%error, "unsubscribe failed");
        }
        info!("dispatch loop stopped");
    }

    async fn resolve_members(&self, channel_id: &str) -> Result<Vec<String>, DispatchError> {
        let directory = self.directory.next()?;
        let timeout = self.settings.rpc_timeout;
        match tokio::time::timeout(timeout, directory.list_members(channel_id)).await {
            Ok(Ok(members)) => Ok(members),
            Ok(Err(source)) => Err(DispatchError::Membership {
                channel_id: channel_id.to_string(),
                source,
            }),
            Err(_) => Err(DispatchError::MembershipTimeout {
                channel_id: channel_id.to_string(),
                timeout,
            }),
        }
    }
}

async fn deliver(
    connectors: Arc<RoutingTable<ConnectorHandle>>,
    connector: ConnectorHandle,
    token: String,
    user_id: String,
    message: Arc<ChannelMessage>,
    timeout: Duration,
) {
    match tokio::time::timeout(timeout, connector.dispatch(&user_id, &message)).await {
        Ok(Ok(())) => {
            debug!(message_id = %message.message_id, %user_id, connector = %token, "delivered");
        }
        Ok(Err(RpcError::Status(status))) if status.code() == tonic::Code::Unavailable => {
            warn!(message_id = %message.message_id, %user_id, connector = %token, %status, "connector unavailable, evicting");
            connectors.evict(&token);
        }
        Ok(Err(error)) => {
            warn!(message_id = %message.message_id, %user_id, connector = %token, %error, "delivery failed");
        }
        Err(_) => {
            warn!(message_id = %message.message_id, %user_id, connector = %token, ?timeout, "delivery timed out");
        }
    }
}
