//! # Services Module
//!
//! Application services composed from the connections and the core engine.

/// Message creation and recent-history reads.
pub mod message;

pub use message::{MessageService, ServiceError};
