//! # Data Models
//!
//! Plain data carried between the bus, the cache and the RPC layer.

/// The chat message record and its JSON codec.
pub mod message;

pub use message::ChannelMessage;
