//! # Connections Module
//!
//! Adapters for the external systems the fan-out tier talks to: the
//! key-value store (Redis, or memory for tests), the message bus and the
//! relational system of record.

/// The key-value contract shared by the cache, the lock and the router.
pub mod kv_store;

/// Redis implementation of the key-value contract.
pub mod cache_redis;

/// In-process implementation of the key-value contract.
pub mod memory_store;

/// NATS publish/queue-subscribe adapter.
pub mod bus_nats;

/// PostgreSQL message repository.
pub mod db_postgres;

pub use bus_nats::{BusError, BusPublisher, BusSubscription, NatsBus, NatsSubscription};
pub use cache_redis::RedisStore;
pub use db_postgres::{MessageRepository, PgMessageRepository, RepoError};
pub use kv_store::{KvStore, StoreError, StoreResult};
pub use memory_store::MemoryStore;
