//! # RPC Clients
//!
//! Outbound calls made by the dispatch pipeline: member lookup on the channel
//! directory and message delivery on the connector that holds a recipient's
//! live connection.
//!
//! The pipeline depends only on the [`ChannelDirectory`] and [`Connector`]
//! traits. The gRPC implementations live in [`channel`] and [`connector`];
//! their handles are built lazily by registry transform functions, so
//! discovering an instance never blocks on dialing it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::core::registry::{BoxError, CleanupFn, ServiceInstance};
use crate::models::ChannelMessage;

/// gRPC client of the channel directory.
pub mod channel;
/// gRPC client of the connector tier.
pub mod connector;
/// Hand-declared protobuf messages.
pub mod proto;

/// Errors raised by outbound RPCs.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("rpc failed: {0}")]
    Status(#[from] tonic::Status),

    #[error("connector refused delivery to '{0}'")]
    Rejected(String),
}

/// Lists the members of a channel.
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    /// Returns the user ids of every member of `channel_id`.
    async fn list_members(&self, channel_id: &str) -> Result<Vec<String>, RpcError>;
}

/// Delivers a message to one connected user.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Pushes `message` to `target_user_id`'s live connection.
    async fn dispatch(&self, target_user_id: &str, message: &ChannelMessage) -> Result<(), RpcError>;
}

/// Shared handle to a channel-directory instance.
pub type DirectoryHandle = Arc<dyn ChannelDirectory>;

/// Shared handle to a connector instance.
pub type ConnectorHandle = Arc<dyn Connector>;

/// Builds a channel to `instance` that dials on first use.
pub(crate) fn lazy_channel(instance: &ServiceInstance, connect_timeout: Duration) -> Result<Channel, RpcError> {
    let endpoint = format!("http://{}:{}", instance.address, instance.port);
    let channel = Endpoint::from_shared(endpoint.clone())
        .map_err(|e| RpcError::InvalidEndpoint {
            endpoint,
            reason: e.to_string(),
        })?
        .connect_timeout(connect_timeout)
        .connect_lazy();
    Ok(channel)
}

/// Registry cleanup for RPC handles of `service`.
///
/// Dropping the registry's reference closes the underlying channel once the
/// last in-flight call holding a clone finishes.
pub fn release_handle<D>(service: impl Into<String>) -> CleanupFn<Arc<D>>
where
    D: ?Sized + Send + Sync + 'static,
{
    let service = service.into();
    Arc::new(move |handle: Arc<D>| -> Result<(), BoxError> {
        let in_flight = Arc::strong_count(&handle) - 1;
        drop(handle);
        debug!(service = %service, in_flight, "rpc handle released");
        Ok(())
    })
}

pub use channel::{directory_transform, GrpcChannelDirectory};
pub use connector::{connector_transform, GrpcConnector};

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    #[async_trait]
    impl Connector for Idle {
        async fn dispatch(&self, _target_user_id: &str, _message: &ChannelMessage) -> Result<(), RpcError> {
            Ok(())
        }
    }

    #[test]
    fn test_release_handle_drops_the_registry_reference() {
        let cleanup = release_handle::<dyn Connector>("ConnectorService");
        let handle: ConnectorHandle = Arc::new(Idle);
        let in_flight = Arc::clone(&handle);

        cleanup(handle).unwrap();
        assert_eq!(Arc::strong_count(&in_flight), 1);
    }
}
