//! # Data Retrieval Module
//!
//! HTTP clients for external control-plane services.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: A generic HTTP `ApiClient` built on `reqwest` and
//!   `reqwest-middleware`, featuring automatic retries with exponential
//!   backoff.
//! - **`consul`**: The service-registry client. It discovers healthy
//!   instances for the routing tables and registers this process.

/// Generic HTTP API client with retry middleware for resilient network requests.
pub mod ky_http;

/// Consul agent client: discovery, registration and TTL heartbeats.
pub mod consul;

pub use consul::ConsulClient;
pub use ky_http::{ApiClient, ApiResponse, HttpError};
