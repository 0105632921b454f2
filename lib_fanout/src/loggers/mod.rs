//! # Logging Module
//!
//! Global `tracing` subscriber setup with stdout and rolling file output.

/// Subscriber installation and log file pruning.
pub mod logger;

pub use logger::{prune_old_logs, setup_logging, LoggingError};
