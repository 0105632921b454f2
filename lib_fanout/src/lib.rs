//! # lib_fanout
//!
//! Real-time channel message fan-out: the dispatch pipeline that delivers
//! each posted message to the connector holding every online member's live
//! connection, and the cache-aside store of recent channel history.

#![forbid(unsafe_code)]

pub mod configs;
pub mod connections;
pub mod core;
pub mod loggers;
pub mod models;
pub mod retrieve;
pub mod rpc;
pub mod services;
