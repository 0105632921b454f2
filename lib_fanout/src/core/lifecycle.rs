//! # Service Lifecycle
//!
//! Registration of this process with the service registry, TTL heartbeats,
//! and deregistration on drain. Also home of [`shutdown_signal`], the future
//! both binaries wait on before draining.
//!
//! With a TTL check the registry expects this process to report "passing"
//! at least once per TTL; otherwise it marks the instance critical and, after
//! `deregister_after`, removes it. The heartbeat task reports every
//! `heartbeat_interval` until the lifecycle is drained.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors raised while talking to the registry about ourselves.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("registry request failed: {0}")]
    Transport(String),

    #[error("registry rejected {action} with status {status}: {body}")]
    Rejected { action: &'static str, status: u16, body: String },

    #[error("heartbeat interval {interval:?} must be shorter than the check TTL {ttl:?}")]
    HeartbeatTooSlow { interval: Duration, ttl: Duration },
}

/// How the registry decides whether this process is healthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheck {
    /// The process reports in at least once per `ttl`.
    Ttl { ttl: Duration },
    /// The registry polls `url` every `interval`.
    Http { url: String, interval: Duration },
}

/// Everything the registry needs to know about this process.
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub check: HealthCheck,
    pub deregister_after: Duration,
}

impl Registration {
    /// The id of this service's health check, `service:<id>`.
    pub fn check_id(&self) -> String {
        check_id(&self.id)
    }
}

/// Check id used by the registry for a service's own check.
pub fn check_id(service_id: &str) -> String {
    format!("service:{service_id}")
}

/// Self-registration operations of a service registry.
#[async_trait]
pub trait ServiceRegistrar: Send + Sync {
    async fn register(&self, registration: &Registration) -> Result<(), LifecycleError>;

    /// Marks the TTL check `check_id` as passing.
    async fn pass_ttl(&self, check_id: &str) -> Result<(), LifecycleError>;

    async fn deregister(&self, service_id: &str) -> Result<(), LifecycleError>;
}

struct Heartbeat {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// A registered service.
pub struct ServiceLifecycle {
    registrar: Arc<dyn ServiceRegistrar>,
    registration: Registration,
    heartbeat: Option<Heartbeat>,
}

impl ServiceLifecycle {
    /// Registers the service and, for TTL checks, reports passing once and
    /// starts the heartbeat task.
    pub async fn start(
        registrar: Arc<dyn ServiceRegistrar>,
        registration: Registration,
        heartbeat_interval: Duration,
    ) -> Result<Self, LifecycleError> {
        if let HealthCheck::Ttl { ttl } = registration.check {
            if heartbeat_interval >= ttl {
                return Err(LifecycleError::HeartbeatTooSlow {
                    interval: heartbeat_interval,
                    ttl,
                });
            }
        }

        registrar.register(&registration).await?;
        info!(
            service_id = %registration.id,
            service = %registration.name,
            address = %registration.address,
            port = registration.port,
            "registered with service registry"
        );

        let heartbeat = match registration.check {
            HealthCheck::Ttl { .. } => {
                let check_id = registration.check_id();
                registrar.pass_ttl(&check_id).await?;
                Some(spawn_heartbeat(Arc::clone(&registrar), check_id, heartbeat_interval))
            }
            HealthCheck::Http { .. } => None,
        };

        Ok(Self {
            registrar,
            registration,
            heartbeat,
        })
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Stops the heartbeat task, leaving the registration in place.
    pub async fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop.cancel();
            if let Err(error) = heartbeat.handle.await {
                warn!(%error, "heartbeat task ended abnormally");
            }
        }
    }

    /// Stops the heartbeat and removes the registration. Failures are
    /// logged; the registry will expire the entry on its own.
    pub async fn drain(mut self) {
        self.stop_heartbeat().await;
        match self.registrar.deregister(&self.registration.id).await {
            Ok(()) => info!(service_id = %self.registration.id, "deregistered from service registry"),
            Err(error) => warn!(service_id = %self.registration.id, %error, "deregistration failed"),
        }
    }
}

fn spawn_heartbeat(registrar: Arc<dyn ServiceRegistrar>, check_id: String, every: Duration) -> Heartbeat {
    let stop = CancellationToken::new();
    let token = stop.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    match registrar.pass_ttl(&check_id).await {
                        Ok(()) => debug!(check_id = %check_id, "ttl check passed"),
                        Err(error) => warn!(check_id = %check_id, %error, "ttl heartbeat failed"),
                    }
                }
            }
        }
    });
    Heartbeat { stop, handle }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(error) => {
                warn!(%error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received, initiating shutdown."),
        _ = terminate => info!("SIGTERM received, initiating shutdown."),
    }
}
