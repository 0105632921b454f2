//! # Registry Client
//!
//! A generic, typed view over one service class in the service registry.
//!
//! Every poll asks an [`InstanceSource`] for the currently healthy instances,
//! turns each one into a caller-defined handle `T` through an injected
//! transform function, and publishes the complete `key -> handle` map in a
//! single swap. Readers take the read side of an `RwLock` and clone an `Arc`
//! of the current map, so they always observe one whole generation.
//!
//! Handles that drop out of the map are passed to the optional cleanup
//! function exactly once, outside the lock.
//!
//! Failure policy: a poll that cannot reach the registry leaves the previous
//! map untouched. A single instance that fails to transform is logged and
//! skipped; it never fails the poll.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

/// Boxed error returned by injected transform and cleanup functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Builds a handle from a discovered instance.
pub type TransformFn<T> = Arc<dyn Fn(&ServiceInstance) -> Result<T, BoxError> + Send + Sync>;

/// Releases a handle that left the map.
pub type CleanupFn<T> = Arc<dyn Fn(T) -> Result<(), BoxError> + Send + Sync>;

/// One healthy instance as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub service_id: String,
    pub service_name: String,
    pub address: String,
    pub port: u16,
}

impl ServiceInstance {
    /// The routing key, `serviceName:serviceID`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.service_name, self.service_id)
    }
}

/// Errors raised while discovering instances.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unreachable: {0}")]
    Unreachable(String),

    #[error("registry returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed registry response: {0}")]
    Malformed(String),

    #[error("registry client is closed")]
    Closed,
}

/// Where healthy instances come from.
#[async_trait]
pub trait InstanceSource: Send + Sync {
    /// Lists the healthy instances of `service`.
    async fn healthy_instances(&self, service: &str) -> Result<Vec<ServiceInstance>, RegistryError>;
}

struct RegistryState<T> {
    closed: bool,
    handles: Arc<BTreeMap<String, T>>,
}

/// Discovers instances of a service and owns one handle per instance.
pub struct RegistryClient<T> {
    source: Arc<dyn InstanceSource>,
    transform: TransformFn<T>,
    cleanup: Option<CleanupFn<T>>,
    state: RwLock<RegistryState<T>>,
}

impl<T> fmt::Debug for RegistryClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read_state();
        f.debug_struct("RegistryClient")
            .field("closed", &state.closed)
            .field("handles", &state.handles.len())
            .finish()
    }
}

impl<T> RegistryClient<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty client.
    pub fn new(source: Arc<dyn InstanceSource>, transform: TransformFn<T>, cleanup: Option<CleanupFn<T>>) -> Self {
        Self {
            source,
            transform,
            cleanup,
            state: RwLock::new(RegistryState {
                closed: false,
                handles: Arc::new(BTreeMap::new()),
            }),
        }
    }

    /// Polls the registry for `service_prefix` and replaces the handle map.
    ///
    /// Returns the instances whose handles were built successfully. On any
    /// discovery error the current map is left as it was.
    pub async fn pull_instances(&self, service_prefix: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        if self.read_state().closed {
            return Err(RegistryError::Closed);
        }

        let discovered = self.source.healthy_instances(service_prefix).await?;

        let mut fresh = BTreeMap::new();
        let mut usable = Vec::with_capacity(discovered.len());
        for instance in discovered {
            match (self.transform)(&instance) {
                Ok(handle) => {
                    fresh.insert(instance.key(), handle);
                    usable.push(instance);
                }
                Err(error) => {
                    warn!(service = service_prefix, instance = %instance.key(), %error, "skipping instance, handle build failed");
                }
            }
        }

        let superseded = {
            let mut state = self.write_state();
            if state.closed {
                drop(state);
                self.cleanup_all(fresh.into_values());
                return Err(RegistryError::Closed);
            }
            std::mem::replace(&mut state.handles, Arc::new(fresh))
        };

        debug!(service = service_prefix, instances = usable.len(), "registry map replaced");
        self.cleanup_all(into_values(superseded));
        Ok(usable)
    }

    /// Returns the handle stored under `key`, if any.
    pub fn get_handle(&self, key: &str) -> Option<T> {
        self.read_state().handles.get(key).cloned()
    }

    /// Evicts one handle, e.g. after a call discovered it was dead.
    pub fn remove_handle(&self, key: &str) -> Option<T> {
        let removed = {
            let mut state = self.write_state();
            Arc::make_mut(&mut state.handles).remove(key)
        };
        if let Some(handle) = &removed {
            self.cleanup_all(std::iter::once(handle.clone()));
        }
        removed
    }

    /// The current generation of the map.
    pub fn snapshot(&self) -> Arc<BTreeMap<String, T>> {
        Arc::clone(&self.read_state().handles)
    }

    /// Number of handles in the current map.
    pub fn len(&self) -> usize {
        self.read_state().handles.len()
    }

    /// Returns `true` when no handle is known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.read_state().closed
    }

    /// Closes the client and cleans up every stored handle. Idempotent.
    pub fn close(&self) {
        let stored = {
            let mut state = self.write_state();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.handles)
        };
        self.cleanup_all(into_values(stored));
    }

    fn cleanup_all(&self, handles: impl IntoIterator<Item = T>) {
        let Some(cleanup) = &self.cleanup else {
            return;
        };
        for handle in handles {
            if let Err(error) = cleanup(handle) {
                warn!(%error, "handle cleanup failed");
            }
        }
    }
}

impl<T> RegistryClient<T> {
    fn read_state(&self) -> RwLockReadGuard<'_, RegistryState<T>> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, RegistryState<T>> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Takes the handles out of a retired generation. Readers may still hold a
/// snapshot of it, in which case the handles are cloned instead.
fn into_values<T: Clone>(map: Arc<BTreeMap<String, T>>) -> Vec<T> {
    match Arc::try_unwrap(map) {
        Ok(map) => map.into_values().collect(),
        Err(shared) => shared.values().cloned().collect(),
    }
}
