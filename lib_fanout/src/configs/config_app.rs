//! # Application Configuration
//!
//! Layered configuration shared by the dispatcher and the message service.
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults,
//! 2. a JSON file (`--config-path`, default `fanout.conf`), camelCase keys,
//! 3. environment variables (`FANOUT_*`) and command-line flags.
//!
//! Every source is parsed into the same all-optional [`ConfigArgs`] and
//! merged field by field; [`ConfigArgs::resolve`] then validates the result
//! into an immutable [`AppConfig`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::core::dispatcher::DispatchSettings;
use crate::core::lifecycle::{HealthCheck, Registration};
use crate::core::message_cache::CacheSettings;

const DEFAULT_CONFIG_FILE: &str = "fanout.conf";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },

    #[error("missing required setting '{0}'")]
    Missing(&'static str),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// How this process asks the registry to check its health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckMode {
    /// The process heartbeats a TTL check.
    Ttl,
    /// The registry polls `GET /health`.
    Http,
}

/// Raw settings from one source. Every field is optional so that sources
/// can be layered.
#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Real-time channel message fan-out", version)]
#[serde(rename_all = "camelCase")]
pub struct ConfigArgs {
    #[clap(long, env = "FANOUT_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "FANOUT_SERVICE_ID", help = "Registry id of this process (default <service-name>-<hostname>).")]
    pub service_id: Option<String>,

    #[clap(long, env = "FANOUT_SERVICE_NAME", help = "Registry service name of this process.")]
    pub service_name: Option<String>,

    #[clap(long, env = "FANOUT_ADVERTISE_HOST", help = "Address other services use to reach this process.")]
    pub advertise_host: Option<String>,

    #[clap(long, env = "FANOUT_PORT", help = "Port for the HTTP endpoint.")]
    pub port: Option<u16>,

    #[clap(long, env = "FANOUT_BUS_URL", help = "Message bus URL.")]
    pub bus_url: Option<String>,

    #[clap(long, env = "FANOUT_BUS_SUBJECT", help = "Subject channel messages are published on.")]
    pub bus_subject: Option<String>,

    #[clap(long, env = "FANOUT_BUS_QUEUE_GROUP", help = "Queue group shared by dispatcher replicas.")]
    pub bus_queue_group: Option<String>,

    #[clap(long, env = "FANOUT_REDIS_URL", help = "Key-value store URL.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "FANOUT_REGISTRY_URL", help = "Service registry base URL.")]
    pub registry_url: Option<String>,

    #[clap(long, env = "FANOUT_REGISTRY_TOKEN", help = "Service registry ACL token.")]
    pub registry_token: Option<String>,

    #[clap(long, env = "FANOUT_CHANNEL_SERVICE_NAME", help = "Registry name of the channel directory.")]
    pub channel_service_name: Option<String>,

    #[clap(long, env = "FANOUT_CONNECTOR_SERVICE_NAME", help = "Registry name of the connector tier.")]
    pub connector_service_name: Option<String>,

    #[clap(long, env = "FANOUT_ROUTING_HASH_KEY", help = "Hash mapping user ids to connector routing tokens.")]
    pub routing_hash_key: Option<String>,

    #[clap(long, env = "FANOUT_HEALTH_CHECK", help = "Registry health check mode (ttl, http).")]
    pub health_check: Option<String>,

    #[clap(long, env = "FANOUT_HEALTH_TTL_SECONDS", help = "TTL of the registry health check.")]
    pub health_ttl_seconds: Option<u64>,

    #[clap(long, env = "FANOUT_HEARTBEAT_INTERVAL_SECONDS", help = "Interval between TTL heartbeats.")]
    pub heartbeat_interval_seconds: Option<u64>,

    #[clap(long, env = "FANOUT_DEREGISTER_AFTER_SECONDS", help = "Critical time after which the registry drops this process.")]
    pub deregister_after_seconds: Option<u64>,

    #[clap(long, env = "FANOUT_REGISTRY_REFRESH_SECONDS", help = "Interval between routing table refreshes.")]
    pub registry_refresh_seconds: Option<u64>,

    #[clap(long, env = "FANOUT_WORKER_POOL_SIZE", help = "Maximum concurrent deliveries.")]
    pub worker_pool_size: Option<usize>,

    #[clap(long, env = "FANOUT_RPC_TIMEOUT_MS", help = "Deadline of every outbound RPC.")]
    pub rpc_timeout_ms: Option<u64>,

    #[clap(long, env = "FANOUT_CACHE_TTL_SECONDS", help = "Lifetime of a cached channel history.")]
    pub cache_ttl_seconds: Option<u64>,

    #[clap(long, env = "FANOUT_LOCK_TTL_MS", help = "Maximum hold time of a cache rebuild lock.")]
    pub lock_ttl_ms: Option<u64>,

    #[clap(long, env = "FANOUT_LOCK_WAIT_MS", help = "Backoff before re-reading after losing the rebuild lock.")]
    pub lock_wait_ms: Option<u64>,

    #[clap(long, env = "FANOUT_CACHE_MAX_MESSAGES", help = "Messages kept per cached channel.")]
    pub cache_max_messages: Option<usize>,

    #[clap(long, env = "FANOUT_DATABASE_URL", help = "System-of-record connection string.")]
    pub database_url: Option<String>,

    #[clap(long, env = "FANOUT_DATABASE_MAX_CONNECTIONS", help = "Pooled database connections.")]
    pub database_max_connections: Option<usize>,

    #[clap(long, env = "FANOUT_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "FANOUT_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "FANOUT_LOG_JSON", help = "Write JSON log lines (true, false).")]
    pub log_json: Option<bool>,

    #[clap(long, env = "FANOUT_DRAIN_TIMEOUT_SECONDS", help = "Grace period for in-flight deliveries on shutdown.")]
    pub drain_timeout_seconds: Option<u64>,
}

impl ConfigArgs {
    /// Built-in defaults for a process registering as `service_name`.
    pub fn defaults(service_name: &str) -> Self {
        Self {
            service_name: Some(service_name.to_string()),
            advertise_host: Some("127.0.0.1".to_string()),
            port: Some(7000),
            bus_url: Some("nats://127.0.0.1:4222".to_string()),
            bus_subject: Some("channel.message".to_string()),
            bus_queue_group: Some("dispatcher".to_string()),
            redis_url: Some("redis://127.0.0.1:6379/0".to_string()),
            registry_url: Some("http://127.0.0.1:8500".to_string()),
            channel_service_name: Some("ChannelService".to_string()),
            connector_service_name: Some("ConnectorService".to_string()),
            routing_hash_key: Some("user:connectors".to_string()),
            health_check: Some("ttl".to_string()),
            health_ttl_seconds: Some(15),
            heartbeat_interval_seconds: Some(5),
            deregister_after_seconds: Some(60),
            registry_refresh_seconds: Some(30),
            worker_pool_size: Some(64),
            rpc_timeout_ms: Some(2_000),
            cache_ttl_seconds: Some(24 * 60 * 60),
            lock_ttl_ms: Some(10_000),
            lock_wait_ms: Some(300),
            cache_max_messages: Some(200),
            database_max_connections: Some(16),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            log_json: Some(false),
            drain_timeout_seconds: Some(10),
            ..Default::default()
        }
    }

    /// Merges two layers; values set in `other` win.
    pub fn merge(self, other: ConfigArgs) -> ConfigArgs {
        ConfigArgs {
            config_path: other.config_path.or(self.config_path),
            service_id: other.service_id.or(self.service_id),
            service_name: other.service_name.or(self.service_name),
            advertise_host: other.advertise_host.or(self.advertise_host),
            port: other.port.or(self.port),
            bus_url: other.bus_url.or(self.bus_url),
            bus_subject: other.bus_subject.or(self.bus_subject),
            bus_queue_group: other.bus_queue_group.or(self.bus_queue_group),
            redis_url: other.redis_url.or(self.redis_url),
            registry_url: other.registry_url.or(self.registry_url),
            registry_token: other.registry_token.or(self.registry_token),
            channel_service_name: other.channel_service_name.or(self.channel_service_name),
            connector_service_name: other.connector_service_name.or(self.connector_service_name),
            routing_hash_key: other.routing_hash_key.or(self.routing_hash_key),
            health_check: other.health_check.or(self.health_check),
            health_ttl_seconds: other.health_ttl_seconds.or(self.health_ttl_seconds),
            heartbeat_interval_seconds: other.heartbeat_interval_seconds.or(self.heartbeat_interval_seconds),
            deregister_after_seconds: other.deregister_after_seconds.or(self.deregister_after_seconds),
            registry_refresh_seconds: other.registry_refresh_seconds.or(self.registry_refresh_seconds),
            worker_pool_size: other.worker_pool_size.or(self.worker_pool_size),
            rpc_timeout_ms: other.rpc_timeout_ms.or(self.rpc_timeout_ms),
            cache_ttl_seconds: other.cache_ttl_seconds.or(self.cache_ttl_seconds),
            lock_ttl_ms: other.lock_ttl_ms.or(self.lock_ttl_ms),
            lock_wait_ms: other.lock_wait_ms.or(self.lock_wait_ms),
            cache_max_messages: other.cache_max_messages.or(self.cache_max_messages),
            database_url: other.database_url.or(self.database_url),
            database_max_connections: other.database_max_connections.or(self.database_max_connections),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            log_json: other.log_json.or(self.log_json),
            drain_timeout_seconds: other.drain_timeout_seconds.or(self.drain_timeout_seconds),
        }
    }

    /// Validates the merged layers into an [`AppConfig`].
    pub fn resolve(self) -> Result<AppConfig, ConfigError> {
        let service_name = require(self.service_name, "serviceName")?;
        let service_id = match self.service_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => format!("{}-{}", service_name, local_hostname()),
        };

        let health_check = match require(self.health_check, "healthCheck")?.to_ascii_lowercase().as_str() {
            "ttl" => HealthCheckMode::Ttl,
            "http" => HealthCheckMode::Http,
            other => {
                return Err(ConfigError::Invalid {
                    field: "healthCheck",
                    reason: format!("expected 'ttl' or 'http', got '{other}'"),
                })
            }
        };

        let health_ttl = Duration::from_secs(require(self.health_ttl_seconds, "healthTtlSeconds")?);
        let heartbeat_interval = Duration::from_secs(require(self.heartbeat_interval_seconds, "heartbeatIntervalSeconds")?);
        if health_check == HealthCheckMode::Ttl && heartbeat_interval >= health_ttl {
            return Err(ConfigError::Invalid {
                field: "heartbeatIntervalSeconds",
                reason: format!("{heartbeat_interval:?} must be shorter than the health TTL {health_ttl:?}"),
            });
        }

        let worker_pool_size = require(self.worker_pool_size, "workerPoolSize")?;
        if worker_pool_size == 0 {
            return Err(ConfigError::Invalid {
                field: "workerPoolSize",
                reason: "must be greater than zero".to_string(),
            });
        }

        let registry_refresh_interval = Duration::from_secs(require(self.registry_refresh_seconds, "registryRefreshSeconds")?);
        if registry_refresh_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "registryRefreshSeconds",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(AppConfig {
            service_id,
            service_name,
            advertise_host: require(self.advertise_host, "advertiseHost")?,
            port: require(self.port, "port")?,
            bus_url: require(self.bus_url, "busUrl")?,
            bus_subject: require(self.bus_subject, "busSubject")?,
            bus_queue_group: require(self.bus_queue_group, "busQueueGroup")?,
            redis_url: require(self.redis_url, "redisUrl")?,
            registry_url: require(self.registry_url, "registryUrl")?,
            registry_token: self.registry_token.filter(|t| !t.is_empty()),
            channel_service_name: require(self.channel_service_name, "channelServiceName")?,
            connector_service_name: require(self.connector_service_name, "connectorServiceName")?,
            routing_hash_key: require(self.routing_hash_key, "routingHashKey")?,
            health_check,
            health_ttl,
            heartbeat_interval,
            deregister_after: Duration::from_secs(require(self.deregister_after_seconds, "deregisterAfterSeconds")?),
            registry_refresh_interval,
            worker_pool_size,
            rpc_timeout: Duration::from_millis(require(self.rpc_timeout_ms, "rpcTimeoutMs")?),
            cache_ttl: Duration::from_secs(require(self.cache_ttl_seconds, "cacheTtlSeconds")?),
            lock_ttl: Duration::from_millis(require(self.lock_ttl_ms, "lockTtlMs")?),
            lock_wait: Duration::from_millis(require(self.lock_wait_ms, "lockWaitMs")?),
            cache_max_messages: require(self.cache_max_messages, "cacheMaxMessages")?,
            database_url: self.database_url.filter(|u| !u.is_empty()),
            database_max_connections: require(self.database_max_connections, "databaseMaxConnections")?,
            log_dir: require(self.log_dir, "logDir")?,
            log_level: require(self.log_level, "logLevel")?,
            log_json: self.log_json.unwrap_or(false),
            drain_timeout: Duration::from_secs(require(self.drain_timeout_seconds, "drainTimeoutSeconds")?),
        })
    }
}

fn require<T>(value: Option<T>, field: &'static str) -> Result<T, ConfigError> {
    value.ok_or(ConfigError::Missing(field))
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// The resolved, immutable configuration of one process.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub service_id: String,
    pub service_name: String,
    pub advertise_host: String,
    pub port: u16,
    pub bus_url: String,
    pub bus_subject: String,
    pub bus_queue_group: String,
    pub redis_url: String,
    pub registry_url: String,
    pub registry_token: Option<String>,
    pub channel_service_name: String,
    pub connector_service_name: String,
    pub routing_hash_key: String,
    pub health_check: HealthCheckMode,
    pub health_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub deregister_after: Duration,
    pub registry_refresh_interval: Duration,
    pub worker_pool_size: usize,
    pub rpc_timeout: Duration,
    pub cache_ttl: Duration,
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
    pub cache_max_messages: usize,
    pub database_url: Option<String>,
    pub database_max_connections: usize,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub log_json: bool,
    pub drain_timeout: Duration,
}

impl AppConfig {
    /// The registry health check matching the configured mode.
    pub fn health_check(&self) -> HealthCheck {
        match self.health_check {
            HealthCheckMode::Ttl => HealthCheck::Ttl { ttl: self.health_ttl },
            HealthCheckMode::Http => HealthCheck::Http {
                url: format!("http://{}:{}/health", self.advertise_host, self.port),
                interval: self.heartbeat_interval,
            },
        }
    }

    /// How this process announces itself to the registry.
    pub fn registration(&self) -> Registration {
        Registration {
            id: self.service_id.clone(),
            name: self.service_name.clone(),
            address: self.advertise_host.clone(),
            port: self.port,
            check: self.health_check(),
            deregister_after: self.deregister_after,
        }
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            ttl: self.cache_ttl,
            lock_ttl: self.lock_ttl,
            lock_wait: self.lock_wait,
            max_messages: self.cache_max_messages,
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            rpc_timeout: self.rpc_timeout,
            routing_hash_key: self.routing_hash_key.clone(),
        }
    }

    /// The system-of-record URL, required by the message service.
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url.as_deref().ok_or(ConfigError::Missing("databaseUrl"))
    }
}

/// Reads one JSON config layer. A missing file is not an error.
pub fn read_config_file(path: &Path) -> Result<Option<ConfigArgs>, ConfigError> {
    if !path.exists() {
        info!(path = %path.display(), "config file not found, using defaults and environment/CLI values");
        return Ok(None);
    }
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed = serde_json::from_str::<ConfigArgs>(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(parsed))
}

/// Layers defaults, the config file and `cli` (which already carries the
/// environment) into an [`AppConfig`].
pub fn load_config_from(service_name: &str, cli: ConfigArgs) -> Result<AppConfig, ConfigError> {
    let path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut layered = ConfigArgs::defaults(service_name);
    if let Some(file_layer) = read_config_file(&path)? {
        layered = layered.merge(file_layer);
    }
    layered.merge(cli).resolve()
}

/// Loads the configuration of a process registering as `service_name`,
/// reading flags and environment from the process.
pub fn load_config(service_name: &str) -> Result<AppConfig, ConfigError> {
    load_config_from(service_name, ConfigArgs::parse())
}
