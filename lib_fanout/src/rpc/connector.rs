//! gRPC client of `dispatch_service.DispatchService`, served by the
//! connector processes that hold user connections.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::uri::PathAndQuery;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::transport::Channel;

use super::proto::{DispatchMessageRequest, DispatchMessageResponse};
use super::{lazy_channel, Connector, ConnectorHandle, RpcError};
use crate::core::registry::{BoxError, ServiceInstance, TransformFn};
use crate::models::ChannelMessage;

const DISPATCH_MESSAGE: &str = "/dispatch_service.DispatchService/DispatchMessage";

/// A connector instance reached over gRPC.
#[derive(Clone)]
pub struct GrpcConnector {
    inner: Grpc<Channel>,
    timeout: Duration,
}

impl GrpcConnector {
    pub fn new(channel: Channel, timeout: Duration) -> Self {
        Self {
            inner: Grpc::new(channel),
            timeout,
        }
    }
}

fn dispatch_request(target_user_id: &str, message: &ChannelMessage) -> DispatchMessageRequest {
    DispatchMessageRequest {
        target_user_id: target_user_id.to_string(),
        message_id: message.message_id.clone(),
        user_id: message.sender_id.clone(),
        channel_id: message.channel_id.clone(),
        content: message.content.clone(),
        created_at: message.created_at,
    }
}

#[async_trait]
impl Connector for GrpcConnector {
    async fn dispatch(&self, target_user_id: &str, message: &ChannelMessage) -> Result<(), RpcError> {
        let mut client = self.inner.clone();
        client
            .ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("connector not ready: {e}")))?;

        let mut request = tonic::Request::new(dispatch_request(target_user_id, message));
        request.set_timeout(self.timeout);

        let codec: ProstCodec<DispatchMessageRequest, DispatchMessageResponse> = ProstCodec::default();
        let response = client
            .unary(request, PathAndQuery::from_static(DISPATCH_MESSAGE), codec)
            .await?;

        if response.into_inner().successful {
            Ok(())
        } else {
            Err(RpcError::Rejected(target_user_id.to_string()))
        }
    }
}

/// Registry transform producing lazily-connected connector handles.
pub fn connector_transform(timeout: Duration) -> TransformFn<ConnectorHandle> {
    Arc::new(move |instance: &ServiceInstance| -> Result<ConnectorHandle, BoxError> {
        let channel = lazy_channel(instance, timeout)?;
        Ok(Arc::new(GrpcConnector::new(channel, timeout)))
    })
}
