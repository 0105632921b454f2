//! # Routing Table
//!
//! Wraps a [`RegistryClient`] scoped to one service class and picks one
//! handle per outbound call. Selection is round-robin over the current
//! generation of the map, which is enough to keep any single instance from
//! being starved. A background task re-polls the registry on a fixed
//! interval until the table is closed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::{RegistryClient, RegistryError};

/// Errors raised when choosing a handle.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("no instance of '{0}' is available")]
    NoInstanceAvailable(String),

    #[error("no instance '{key}' of '{service}' is known")]
    UnknownInstance { service: String, key: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

struct RefreshTask {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Handle selection over the healthy instances of one service.
pub struct RoutingTable<T> {
    service: String,
    registry: Arc<RegistryClient<T>>,
    cursor: AtomicUsize,
    refresher: Mutex<Option<RefreshTask>>,
}

impl<T> RoutingTable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a table for `service`. Call [`refresh`](Self::refresh) or
    /// [`start_refresh`](Self::start_refresh) to populate it.
    pub fn new(service: impl Into<String>, registry: Arc<RegistryClient<T>>) -> Self {
        Self {
            service: service.into(),
            registry,
            cursor: AtomicUsize::new(0),
            refresher: Mutex::new(None),
        }
    }

    /// Polls the registry once. Returns the number of usable instances.
    pub async fn refresh(&self) -> Result<usize, RoutingError> {
        let instances = self.registry.pull_instances(&self.service).await?;
        Ok(instances.len())
    }

    /// Spawns the periodic refresh task. A second call is a no-op.
    ///
    /// The first tick is skipped; callers are expected to have run an
    /// initial [`refresh`](Self::refresh) during startup.
    pub fn start_refresh(self: &Arc<Self>, every: Duration) {
        let mut slot = self.refresher.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return;
        }

        let stop = CancellationToken::new();
        let table = Arc::clone(self);
        let token = stop.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match table.refresh().await {
                            Ok(count) => debug!(service = %table.service, instances = count, "routing table refreshed"),
                            Err(error) => warn!(service = %table.service, %error, "routing table refresh failed, keeping previous instances"),
                        }
                    }
                }
            }
            debug!(service = %table.service, "routing table refresh stopped");
        });

        *slot = Some(RefreshTask { stop, handle });
    }

    /// Picks the next handle in round-robin order.
    pub fn next(&self) -> Result<T, RoutingError> {
        let handles = self.registry.snapshot();
        if handles.is_empty() {
            return Err(RoutingError::NoInstanceAvailable(self.service.clone()));
        }
        let position = self.cursor.fetch_add(1, Ordering::Relaxed) % handles.len();
        handles
            .values()
            .nth(position)
            .cloned()
            .ok_or_else(|| RoutingError::NoInstanceAvailable(self.service.clone()))
    }

    /// Looks up the handle registered under `key`.
    pub fn get(&self, key: &str) -> Result<T, RoutingError> {
        self.registry.get_handle(key).ok_or_else(|| RoutingError::UnknownInstance {
            service: self.service.clone(),
            key: key.to_string(),
        })
    }

    /// Drops the handle under `key` until the next refresh rediscovers it.
    pub fn evict(&self, key: &str) {
        if self.registry.remove_handle(key).is_some() {
            info!(service = %self.service, key, "evicted instance handle");
        }
    }

    /// Number of handles currently routable.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Returns `true` when nothing is routable.
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Stops the refresh task and closes the registry client, cleaning up
    /// every live handle.
    pub async fn close(&self) {
        let task = self
            .refresher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.stop.cancel();
            if let Err(error) = task.handle.await {
                warn!(service = %self.service, %error, "refresh task ended abnormally");
            }
        }
        self.registry.close();
        info!(service = %self.service, "routing table closed");
    }
}
