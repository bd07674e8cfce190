//! Reconciliation queue.
//!
//! Denied changes are handed to an external reconciler by publishing a
//! [`ResourceIdentity`] to a broker topic. Publishing is best effort and
//! at most once: failures are reported back to the caller, never retried here.

pub mod directory;
pub mod publisher;

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PublishError;
use crate::health::HealthState;
use crate::webhooks::codec::AdmissionRequest;

pub use directory::{BrokerDirectory, BrokerEndpoint, ServiceBrokerDirectory, bootstrap_endpoints};
pub use publisher::KafkaReconcileQueue;

/// Flat description of a resource whose change was denied.
///
/// Serialized field names match what existing reconcilers consume.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceIdentity {
    /// Fresh per denial, so consumers can de-duplicate
    #[serde(rename = "MessageID")]
    pub message_id: Uuid,
    pub name: String,
    pub namespace: String,
    pub kind: String,
    pub group: String,
    pub version: String,
}

impl ResourceIdentity {
    /// Describe the target of an admission request with a new correlation ID
    pub fn from_request(request: &AdmissionRequest) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            name: request.name.clone(),
            namespace: request.namespace().to_string(),
            kind: request.kind.kind.clone(),
            group: request.kind.group.clone(),
            version: request.kind.version.clone(),
        }
    }

    /// Self-describing payload sent to the broker
    pub fn to_payload(&self) -> Result<Vec<u8>, PublishError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Capability to queue a resource for reconciliation.
///
/// The Kafka implementation connects per call; a pooled implementation can be
/// substituted without touching the policy engine.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReconcileQueue: Send + Sync {
    /// Enqueue one event. Returns once the broker acknowledged it.
    async fn publish(&self, resource: &ResourceIdentity) -> Result<(), PublishError>;
}

/// Counts publish attempts by result on the shared metrics.
pub struct MeteredQueue<Q> {
    inner: Q,
    health: Arc<HealthState>,
}

impl<Q: ReconcileQueue> MeteredQueue<Q> {
    pub fn new(inner: Q, health: Arc<HealthState>) -> Self {
        Self { inner, health }
    }
}

#[async_trait]
impl<Q: ReconcileQueue> ReconcileQueue for MeteredQueue<Q> {
    async fn publish(&self, resource: &ResourceIdentity) -> Result<(), PublishError> {
        let result = self.inner.publish(resource).await;
        self.health.metrics.record_publish(result.is_ok());
        result
    }
}
