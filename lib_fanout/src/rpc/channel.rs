//! gRPC client of `channel.ChannelService`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::uri::PathAndQuery;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::transport::Channel;

use super::proto::{ListChannelMembersRequest, ListChannelMembersResponse};
use super::{lazy_channel, ChannelDirectory, DirectoryHandle, RpcError};
use crate::core::registry::{BoxError, ServiceInstance, TransformFn};

const LIST_CHANNEL_MEMBERS: &str = "/channel.ChannelService/ListChannelMembers";

/// A channel-directory instance reached over gRPC.
#[derive(Clone)]
pub struct GrpcChannelDirectory {
    inner: Grpc<Channel>,
    timeout: Duration,
}

impl GrpcChannelDirectory {
    /// Wraps an existing channel. `timeout` is sent as the gRPC deadline.
    pub fn new(channel: Channel, timeout: Duration) -> Self {
        Self {
            inner: Grpc::new(channel),
            timeout,
        }
    }
}

#[async_trait]
impl ChannelDirectory for GrpcChannelDirectory {
    async fn list_members(&self, channel_id: &str) -> Result<Vec<String>, RpcError> {
        let mut client = self.inner.clone();
        client
            .ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("channel service not ready: {e}")))?;

        let mut request = tonic::Request::new(ListChannelMembersRequest {
            channel_id: channel_id.to_string(),
        });
        request.set_timeout(self.timeout);

        let codec: ProstCodec<ListChannelMembersRequest, ListChannelMembersResponse> = ProstCodec::default();
        let response = client
            .unary(request, PathAndQuery::from_static(LIST_CHANNEL_MEMBERS), codec)
            .await?;

        Ok(response
            .into_inner()
            .members
            .into_iter()
            .map(|member| member.user_id)
            .collect())
    }
}

/// Registry transform producing lazily-connected directory handles.
pub fn directory_transform(timeout: Duration) -> TransformFn<DirectoryHandle> {
    Arc::new(move |instance: &ServiceInstance| -> Result<DirectoryHandle, BoxError> {
        let channel = lazy_channel(instance, timeout)?;
        Ok(Arc::new(GrpcChannelDirectory::new(channel, timeout)))
    })
}
