//! Broker discovery through the cluster's service registry.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::config::BrokerConfig;
use crate::error::PublishError;

/// Name fragment identifying a broker cluster's bootstrap service
const BOOTSTRAP_MARKER: &str = "bootstrap";
/// `clusterIP` value of a headless service
const HEADLESS_CLUSTER_IP: &str = "None";

/// `host:port` of a broker entry point.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerEndpoint(String);

impl BrokerEndpoint {
    pub fn new(host: &str, port: u16) -> Self {
        let address: String = format!("{}:{}", host, port)
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        Self(address)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of broker endpoints. Queried on every publish; implementations
/// may cache.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerDirectory: Send + Sync {
    /// Current broker endpoints. An empty list is not an error here.
    async fn discover(&self) -> Result<Vec<BrokerEndpoint>, PublishError>;
}

/// Discovers bootstrap services of the configured broker cluster through the
/// Kubernetes Service API.
pub struct ServiceBrokerDirectory {
    client: Client,
    config: BrokerConfig,
}

impl ServiceBrokerDirectory {
    pub fn new(client: Client, config: BrokerConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl BrokerDirectory for ServiceBrokerDirectory {
    async fn discover(&self) -> Result<Vec<BrokerEndpoint>, PublishError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let selector = self.config.label_selector();
        let list = services
            .list(&ListParams::default().labels(&selector))
            .await?;

        debug!(
            namespace = %self.config.namespace,
            selector = %selector,
            count = list.items.len(),
            "Listed broker services"
        );

        Ok(bootstrap_endpoints(&list.items, self.config.port))
    }
}

/// Select bootstrap services that have a virtual IP and turn them into
/// `clusterIP:port` endpoints, in listing order.
pub fn bootstrap_endpoints(services: &[Service], port: u16) -> Vec<BrokerEndpoint> {
    services
        .iter()
        .filter(|svc| svc.name_any().contains(BOOTSTRAP_MARKER))
        .filter_map(|svc| {
            let ip = svc.spec.as_ref()?.cluster_ip.as_deref()?;
            if ip.is_empty() || ip == HEADLESS_CLUSTER_IP {
                return None;
            }
            Some(BrokerEndpoint::new(ip, port))
        })
        .collect()
}
