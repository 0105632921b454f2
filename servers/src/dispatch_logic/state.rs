//! Wiring of the dispatcher process: every long-lived component, built in
//! startup order and torn down in drain order.

use std::sync::Arc;

use anyhow::{Context, Result};
use lib_fanout::configs::AppConfig;
use lib_fanout::connections::{KvStore, NatsBus, NatsSubscription, RedisStore};
use lib_fanout::core::{
    Dispatcher, InstanceSource, RegistryClient, RoutingTable, ServiceLifecycle, ServiceRegistrar, WorkerPool,
};
use lib_fanout::retrieve::ConsulClient;
use lib_fanout::rpc::{ConnectorHandle, DirectoryHandle, connector_transform, directory_transform, release_handle};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct DispatchRuntime {
    config: AppConfig,
    consul: Arc<ConsulClient>,
    bus: NatsBus,
    directory: Arc<RoutingTable<DirectoryHandle>>,
    connectors: Arc<RoutingTable<ConnectorHandle>>,
    pool: Arc<WorkerPool>,
    pub dispatcher: Arc<Dispatcher>,
}

impl DispatchRuntime {
    /// Connects to every dependency. Any failure here aborts startup.
    pub async fn connect(config: AppConfig) -> Result<Self> {
        let routes: Arc<dyn KvStore> = Arc::new(
            RedisStore::connect(&config.redis_url, config.rpc_timeout)
                .await
                .context("failed to connect to redis")?,
        );

        let consul = Arc::new(
            ConsulClient::new(&config.registry_url, config.registry_token.as_deref(), config.rpc_timeout)
                .context("failed to build registry client")?,
        );

        let directory = Arc::new(RoutingTable::new(
            config.channel_service_name.clone(),
            Arc::new(RegistryClient::new(
                Arc::clone(&consul) as Arc<dyn InstanceSource>,
                directory_transform(config.rpc_timeout),
                Some(release_handle(config.channel_service_name.clone())),
            )),
        ));
        let connectors = Arc::new(RoutingTable::new(
            config.connector_service_name.clone(),
            Arc::new(RegistryClient::new(
                Arc::clone(&consul) as Arc<dyn InstanceSource>,
                connector_transform(config.rpc_timeout),
                Some(release_handle(config.connector_service_name.clone())),
            )),
        ));

        // An empty table fills in on the next refresh; messages before that are dropped.
        for table_refresh in [directory.refresh().await, connectors.refresh().await] {
            if let Err(error) = table_refresh {
                warn!(%error, "initial registry poll failed");
            }
        }
        directory.start_refresh(config.registry_refresh_interval);
        connectors.start_refresh(config.registry_refresh_interval);
        info!(
            directory = directory.len(),
            connectors = connectors.len(),
            "routing tables ready"
        );

        let pool = Arc::new(WorkerPool::new(config.worker_pool_size).context("invalid worker pool size")?);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&directory),
            Arc::clone(&connectors),
            routes,
            Arc::clone(&pool),
            config.dispatch_settings(),
        ));

        let bus = NatsBus::connect(&config.bus_url).await.context("failed to connect to the bus")?;

        Ok(Self {
            config,
            consul,
            bus,
            directory,
            connectors,
            pool,
            dispatcher,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn subscribe(&self) -> Result<NatsSubscription> {
        self.bus
            .queue_subscribe(&self.config.bus_subject, &self.config.bus_queue_group)
            .await
            .context("failed to subscribe to the message subject")
    }

    /// Registers this process with the registry and starts its heartbeat.
    pub async fn register(&self) -> Result<ServiceLifecycle> {
        ServiceLifecycle::start(
            Arc::clone(&self.consul) as Arc<dyn ServiceRegistrar>,
            self.config.registration(),
            self.config.heartbeat_interval,
        )
        .await
        .context("failed to register with the service registry")
    }

    /// Tears the process down: stop consuming, stop heartbeating, let
    /// in-flight deliveries finish, close the routing tables, flush the bus,
    /// then leave the registry.
    pub async fn drain(
        self,
        consumer: JoinHandle<()>,
        stop_consuming: CancellationToken,
        mut lifecycle: ServiceLifecycle,
    ) {
        info!("draining dispatcher");

        stop_consuming.cancel();
        if let Err(error) = consumer.await {
            warn!(%error, "dispatch loop ended abnormally");
        }

        lifecycle.stop_heartbeat().await;

        if !self.pool.release(self.config.drain_timeout).await {
            warn!(timeout = ?self.config.drain_timeout, "in-flight deliveries abandoned");
        }

        self.directory.close().await;
        self.connectors.close().await;

        if let Err(error) = self.bus.flush().await {
            warn!(%error, "bus flush failed");
        }

        lifecycle.drain().await;
        info!("dispatcher drained");
    }
}
