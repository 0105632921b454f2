//! Wiring of the message service process.

use std::sync::Arc;

use anyhow::{Context, Result};
use lib_fanout::configs::AppConfig;
use lib_fanout::connections::{BusPublisher, KvStore, MessageRepository, NatsBus, PgMessageRepository, RedisStore};
use lib_fanout::core::{MessageCache, ServiceLifecycle, ServiceRegistrar};
use lib_fanout::retrieve::ConsulClient;
use lib_fanout::services::MessageService;
use tracing::{info, warn};

/// State shared by the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub messages: Arc<MessageService>,
}

pub struct MessageRuntime {
    config: AppConfig,
    consul: Arc<ConsulClient>,
    bus: NatsBus,
    pub state: AppState,
}

impl MessageRuntime {
    /// Connects to every dependency. Any failure here aborts startup.
    pub async fn connect(config: AppConfig) -> Result<Self> {
        let repo = PgMessageRepository::new(config.require_database_url()?, config.database_max_connections)
            .context("failed to create database pool")?;
        repo.ensure_schema().await.context("failed to prepare message table")?;

        let store: Arc<dyn KvStore> = Arc::new(
            RedisStore::connect(&config.redis_url, config.rpc_timeout)
                .await
                .context("failed to connect to redis")?,
        );
        let bus = NatsBus::connect(&config.bus_url).await.context("failed to connect to the bus")?;
        let consul = Arc::new(
            ConsulClient::new(&config.registry_url, config.registry_token.as_deref(), config.rpc_timeout)
                .context("failed to build registry client")?,
        );

        let messages = MessageService::new(
            MessageCache::new(store, config.cache_settings()),
            Arc::new(repo) as Arc<dyn MessageRepository>,
            Arc::new(bus.clone()) as Arc<dyn BusPublisher>,
            config.bus_subject.clone(),
            config.cache_max_messages,
        );
        info!(subject = %config.bus_subject, "message service ready");

        Ok(Self {
            config,
            consul,
            bus,
            state: AppState {
                messages: Arc::new(messages),
            },
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn register(&self) -> Result<ServiceLifecycle> {
        ServiceLifecycle::start(
            Arc::clone(&self.consul) as Arc<dyn ServiceRegistrar>,
            self.config.registration(),
            self.config.heartbeat_interval,
        )
        .await
        .context("failed to register with the service registry")
    }

    /// Runs after the HTTP server has stopped accepting requests.
    pub async fn drain(self, mut lifecycle: ServiceLifecycle) {
        info!("draining message service");
        lifecycle.stop_heartbeat().await;

        self.state.messages.flush_writes(self.config.drain_timeout).await;

        if let Err(error) = self.bus.flush().await {
            warn!(%error, "bus flush failed");
        }

        lifecycle.drain().await;
        info!("message service drained");
    }
}
