//! heimdall-webhook library crate
//!
//! An admission webhook that lets only a resource's owner change its `spec`
//! and protected labels, and queues rejected changes for reconciliation.

pub mod config;
pub mod error;
pub mod health;
pub mod reconcile;
pub mod webhooks;

pub use config::{BrokerConfig, OwnershipPolicy, WebhookConfig};
pub use error::{DecisionError, DenialReason, PublishError, ServerError, TransportError};
pub use health::{HealthState, run_health_server};
pub use reconcile::{KafkaReconcileQueue, MeteredQueue, ReconcileQueue, ResourceIdentity};
pub use webhooks::{OwnershipEngine, WebhookState, run_webhook_server};
