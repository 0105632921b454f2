//! # Configuration Module
//!
//! Layered process configuration: built-in defaults, a JSON file, then
//! environment variables and command-line flags.

/// Loading, merging and validation of the process configuration.
pub mod config_app;

pub use config_app::{load_config, load_config_from, AppConfig, ConfigArgs, ConfigError, HealthCheckMode};
