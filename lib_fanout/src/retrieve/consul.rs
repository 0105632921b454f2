//! # Consul Registry Client
//!
//! HTTP access to a Consul agent for both directions of service discovery:
//! listing the passing instances of a service ([`InstanceSource`]) and
//! registering, heartbeating and deregistering this process
//! ([`ServiceRegistrar`]).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ky_http::{ApiClient, ApiResponse, HttpError};
use crate::core::lifecycle::{HealthCheck, LifecycleError, Registration, ServiceRegistrar};
use crate::core::registry::{InstanceSource, RegistryError, ServiceInstance};

/// One element of `/v1/health/service/{name}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    #[serde(default)]
    node: Option<NodeEntry>,
    service: ServiceEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeEntry {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    address: String,
    port: u16,
}

impl HealthEntry {
    fn into_instance(self) -> ServiceInstance {
        // Services registered without an address inherit the node's.
        let address = if self.service.address.is_empty() {
            self.node.map(|node| node.address).unwrap_or_default()
        } else {
            self.service.address
        };
        ServiceInstance {
            service_id: self.service.id,
            service_name: self.service.service,
            address,
            port: self.service.port,
        }
    }
}

/// Serializable form of the Consul agent registration body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: &'a str,
    port: u16,
    check: AgentCheck,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(rename = "TTL", skip_serializing_if = "Option::is_none")]
    ttl: Option<String>,
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    http: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval: Option<String>,
    deregister_critical_service_after: String,
}

impl<'a> From<&'a Registration> for AgentRegistration<'a> {
    fn from(registration: &'a Registration) -> Self {
        let (ttl, http, interval) = match &registration.check {
            HealthCheck::Ttl { ttl } => (Some(consul_duration(*ttl)), None, None),
            HealthCheck::Http { url, interval } => (None, Some(url.clone()), Some(consul_duration(*interval))),
        };
        Self {
            id: &registration.id,
            name: &registration.name,
            address: &registration.address,
            port: registration.port,
            check: AgentCheck {
                check_id: registration.check_id(),
                ttl,
                http,
                interval,
                deregister_critical_service_after: consul_duration(registration.deregister_after),
            },
        }
    }
}

/// Formats a duration the way the registry parses them (`"15s"`, `"1500ms"`).
fn consul_duration(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// A Consul agent reached over HTTP.
#[derive(Clone)]
pub struct ConsulClient {
    api: ApiClient,
}

impl ConsulClient {
    /// Creates a client for the agent at `base_url`.
    ///
    /// # Arguments
    /// * `base_url` - e.g. "http://127.0.0.1:8500".
    /// * `token` - Optional ACL token, sent as `X-Consul-Token`.
    /// * `timeout` - Per-attempt request timeout.
    pub fn new(base_url: &str, token: Option<&str>, timeout: Duration) -> Result<Self, HttpError> {
        let headers: Vec<(&str, &str)> = token.map(|t| vec![("X-Consul-Token", t)]).unwrap_or_default();
        let api = ApiClient::new(base_url, &headers, timeout, 3)?;
        Ok(Self { api })
    }

    async fn agent_put(&self, action: &'static str, path: &str, body: Option<&AgentRegistration<'_>>) -> Result<(), LifecycleError> {
        let response = self
            .api
            .send(Method::PUT, path, body)
            .await
            .map_err(|e| LifecycleError::Transport(e.to_string()))?;
        ensure_accepted(action, response)
    }
}

fn ensure_accepted(action: &'static str, response: ApiResponse<()>) -> Result<(), LifecycleError> {
    if response.success {
        Ok(())
    } else {
        Err(LifecycleError::Rejected {
            action,
            status: response.status,
            body: response.error_body.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl InstanceSource for ConsulClient {
    async fn healthy_instances(&self, service: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        let path = format!("v1/health/service/{service}?passing=true");
        let response: ApiResponse<Vec<HealthEntry>> = self
            .api
            .request::<_, ()>(Method::GET, &path, None)
            .await
            .map_err(|e| match e {
                HttpError::Decode(reason) => RegistryError::Malformed(reason),
                other => RegistryError::Unreachable(other.to_string()),
            })?;

        if !response.success {
            return Err(RegistryError::Status {
                status: response.status,
                body: response.error_body.unwrap_or_default(),
            });
        }

        let entries = response.data.unwrap_or_default();
        debug!(service, instances = entries.len(), "registry returned healthy instances");
        Ok(entries.into_iter().map(HealthEntry::into_instance).collect())
    }
}

#[async_trait]
impl ServiceRegistrar for ConsulClient {
    async fn register(&self, registration: &Registration) -> Result<(), LifecycleError> {
        let body = AgentRegistration::from(registration);
        self.agent_put("register", "v1/agent/service/register", Some(&body)).await
    }

    async fn pass_ttl(&self, check_id: &str) -> Result<(), LifecycleError> {
        let path = format!("v1/agent/check/pass/{check_id}");
        self.agent_put("ttl pass", &path, None).await
    }

    async fn deregister(&self, service_id: &str) -> Result<(), LifecycleError> {
        let path = format!("v1/agent/service/deregister/{service_id}");
        self.agent_put("deregister", &path, None).await
    }
}
