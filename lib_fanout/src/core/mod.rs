//! # Core Engine Module
//!
//! The fan-out engine: discovery, routing, caching and delivery.
//!
//! ## Core Components:
//!
//! - **`registry`**: A generic registry client. It turns the healthy
//!   instances of a service into caller-defined handles and republishes the
//!   whole `key -> handle` map atomically on every poll.
//!
//! - **`balancer`**: A routing table over one registry client, with
//!   round-robin selection and a cancellable background refresh.
//!
//! - **`lock`** and **`message_cache`**: The cache-aside store for recent
//!   channel history and the token-checked distributed lock that keeps its
//!   rebuilds to one caller per channel.
//!
//! - **`worker_pool`**: The bounded pool that caps concurrent deliveries.
//!
//! - **`dispatcher`**: The bus consumer that resolves recipients and fans
//!   each message out through the pool.
//!
//! - **`lifecycle`**: Registration, TTL heartbeats and graceful drain.

/// Generic service-registry client with atomic map replacement.
pub mod registry;
/// Round-robin routing over a registry client.
pub mod balancer;
/// Token-checked distributed lock.
pub mod lock;
/// Cache-aside store of recent channel messages.
pub mod message_cache;
/// Bounded pool of delivery tasks.
pub mod worker_pool;
/// The bus-driven fan-out pipeline.
pub mod dispatcher;
/// Self-registration, heartbeat and shutdown handling.
pub mod lifecycle;

// --- Public API Re-exports ---
pub use balancer::{RoutingError, RoutingTable};
pub use dispatcher::{DispatchError, DispatchReport, DispatchSettings, Dispatcher};
pub use lifecycle::{shutdown_signal, HealthCheck, LifecycleError, Registration, ServiceLifecycle, ServiceRegistrar};
pub use lock::{DistributedLock, LockError, LockGuard};
pub use message_cache::{CacheError, CacheSettings, MessageCache};
pub use registry::{BoxError, CleanupFn, InstanceSource, RegistryClient, RegistryError, ServiceInstance, TransformFn};
pub use worker_pool::{PoolError, WorkerPool};
