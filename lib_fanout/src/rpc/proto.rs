//! # RPC Wire Messages
//!
//! Protocol buffer messages of the channel-directory and connector services,
//! declared by hand with `prost` derives. Field tags follow the services'
//! `.proto` definitions.

use prost::Message;

/// Request of `channel.ChannelService/ListChannelMembers`.
#[derive(Clone, PartialEq, Message)]
pub struct ListChannelMembersRequest {
    #[prost(string, tag = "1")]
    pub channel_id: String,
}

/// One member of a channel.
#[derive(Clone, PartialEq, Message)]
pub struct ChannelMember {
    #[prost(string, tag = "1")]
    pub user_id: String,

    /// Unix seconds at which the user joined.
    #[prost(int64, tag = "2")]
    pub joined_at: i64,
}

/// Response of `channel.ChannelService/ListChannelMembers`.
#[derive(Clone, PartialEq, Message)]
pub struct ListChannelMembersResponse {
    #[prost(message, repeated, tag = "1")]
    pub members: Vec<ChannelMember>,
}

/// Request of `dispatch_service.DispatchService/DispatchMessage`.
///
/// `user_id` is the sender of the message, `target_user_id` the recipient
/// whose live connection the connector holds.
#[derive(Clone, PartialEq, Message)]
pub struct DispatchMessageRequest {
    #[prost(string, tag = "1")]
    pub target_user_id: String,
    #[prost(string, tag = "2")]
    pub message_id: String,
    #[prost(string, tag = "3")]
    pub user_id: String,
    #[prost(string, tag = "4")]
    pub channel_id: String,
    #[prost(string, tag = "5")]
    pub content: String,
    #[prost(int64, tag = "6")]
    pub created_at: i64,
}

/// Response of `dispatch_service.DispatchService/DispatchMessage`.
#[derive(Clone, PartialEq, Message)]
pub struct DispatchMessageResponse {
    #[prost(bool, tag = "1")]
    pub successful: bool,
}
