//! Runtime configuration for the webhook.
//!
//! Every fixed string the ownership gate depends on (label keys, topic name,
//! broker namespace and cluster, partition and replication numbers) lives
//! here with a documented default. Values come from command-line flags or
//! `HEIMDALL_*` environment variables.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::ServerError;

/// Default path to webhook TLS certificate
pub const WEBHOOK_CERT_PATH: &str = "/run/secrets/tls/tls.crt";
/// Default path to webhook TLS private key
pub const WEBHOOK_KEY_PATH: &str = "/run/secrets/tls/tls.key";
/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 8443;
/// Default health/metrics server port
pub const HEALTH_PORT: u16 = 8080;

/// Process-wide configuration, parsed once at startup and shared read-only.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "heimdall-webhook", version, about)]
pub struct WebhookConfig {
    /// Port the TLS admission endpoint listens on
    #[arg(long, env = "HEIMDALL_WEBHOOK_PORT", default_value_t = WEBHOOK_PORT)]
    pub webhook_port: u16,

    /// Port for /healthz, /readyz, /metrics and /errors
    #[arg(long, env = "HEIMDALL_HEALTH_PORT", default_value_t = HEALTH_PORT)]
    pub health_port: u16,

    /// PEM certificate served by the admission endpoint
    #[arg(long, env = "HEIMDALL_TLS_CERT", default_value = WEBHOOK_CERT_PATH)]
    pub cert_path: PathBuf,

    /// PEM private key for the certificate
    #[arg(long, env = "HEIMDALL_TLS_KEY", default_value = WEBHOOK_KEY_PATH)]
    pub key_path: PathBuf,

    /// HTTP path the control plane posts admission reviews to
    #[arg(long, env = "HEIMDALL_ADMISSION_PATH", default_value = "/mutate")]
    pub admission_path: String,

    /// Namespace holding the broker cluster's services
    #[arg(long, env = "HEIMDALL_BROKER_NAMESPACE", default_value = "heimdall")]
    pub broker_namespace: String,

    /// Name of the broker cluster used in the service label selector
    #[arg(
        long,
        env = "HEIMDALL_BROKER_CLUSTER",
        default_value = "heimdall-kafka-cluster"
    )]
    pub broker_cluster: String,

    /// Client port appended to each bootstrap service address
    #[arg(long, env = "HEIMDALL_BROKER_PORT", default_value_t = 9092)]
    pub broker_port: u16,

    /// Label recording the identity allowed to change a resource
    #[arg(long, env = "HEIMDALL_OWNER_LABEL", default_value = "app.heimdall.io/owner")]
    pub owner_label: String,

    /// Label anyone may change alongside the owner label
    #[arg(
        long,
        env = "HEIMDALL_PRIORITY_LABEL",
        default_value = "app.heimdall.io/priority"
    )]
    pub priority_label: String,

    /// Topic denied changes are queued on
    #[arg(long, env = "HEIMDALL_TOPIC", default_value = "heimdall-topic")]
    pub topic: String,

    /// Partition count used when the topic has to be created
    #[arg(long, env = "HEIMDALL_TOPIC_PARTITIONS", default_value_t = 2)]
    pub topic_partitions: i32,

    /// Replication factor used when the topic has to be created
    #[arg(long, env = "HEIMDALL_TOPIC_REPLICATION", default_value_t = 1)]
    pub topic_replication: i16,

    /// Total budget for one reconcile publish, shared by broker discovery,
    /// connect, topic setup and send. Keep it below the webhook timeout.
    #[arg(long, env = "HEIMDALL_BROKER_TIMEOUT_SECS", default_value_t = 5)]
    pub broker_timeout_secs: u64,

    /// Namespaces owned by the control plane; requests there skip the policy
    #[arg(
        long,
        env = "HEIMDALL_RESERVED_NAMESPACES",
        value_delimiter = ',',
        default_value = "kube-system,kube-public"
    )]
    pub reserved_namespaces: Vec<String>,

    /// Also queue a reconcile when the old or new object cannot be decoded
    #[arg(long, env = "HEIMDALL_PUBLISH_ON_DECODE_FAILURE")]
    pub publish_on_decode_failure: bool,

    /// Largest admission review body accepted, in bytes
    #[arg(long, env = "HEIMDALL_MAX_BODY_BYTES", default_value_t = 3 * 1024 * 1024)]
    pub max_body_bytes: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            webhook_port: WEBHOOK_PORT,
            health_port: HEALTH_PORT,
            cert_path: PathBuf::from(WEBHOOK_CERT_PATH),
            key_path: PathBuf::from(WEBHOOK_KEY_PATH),
            admission_path: "/mutate".to_string(),
            broker_namespace: "heimdall".to_string(),
            broker_cluster: "heimdall-kafka-cluster".to_string(),
            broker_port: 9092,
            owner_label: "app.heimdall.io/owner".to_string(),
            priority_label: "app.heimdall.io/priority".to_string(),
            topic: "heimdall-topic".to_string(),
            topic_partitions: 2,
            topic_replication: 1,
            broker_timeout_secs: 5,
            reserved_namespaces: vec!["kube-system".to_string(), "kube-public".to_string()],
            publish_on_decode_failure: false,
            max_body_bytes: 3 * 1024 * 1024,
        }
    }
}

impl WebhookConfig {
    /// Reject combinations that would make the gate or the publisher misbehave.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.topic_partitions < 1 {
            return Err(ServerError::Config(format!(
                "topic partitions must be at least 1 (got {})",
                self.topic_partitions
            )));
        }
        if self.topic_replication < 1 {
            return Err(ServerError::Config(format!(
                "topic replication must be at least 1 (got {})",
                self.topic_replication
            )));
        }
        if self.broker_timeout_secs == 0 {
            return Err(ServerError::Config(
                "broker timeout must be greater than zero".to_string(),
            ));
        }
        if self.owner_label.is_empty() || self.owner_label == self.priority_label {
            return Err(ServerError::Config(
                "owner label must be set and differ from the priority label".to_string(),
            ));
        }
        if !self.admission_path.starts_with('/') {
            return Err(ServerError::Config(format!(
                "admission path must start with '/' (got {})",
                self.admission_path
            )));
        }
        Ok(())
    }

    /// The subset consumed by the ownership policy engine
    pub fn ownership_policy(&self) -> OwnershipPolicy {
        OwnershipPolicy {
            owner_label: self.owner_label.clone(),
            priority_label: self.priority_label.clone(),
            reserved_namespaces: self.reserved_namespaces.iter().cloned().collect(),
            publish_on_decode_failure: self.publish_on_decode_failure,
        }
    }

    /// The subset consumed by broker discovery and the publisher
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            namespace: self.broker_namespace.clone(),
            cluster: self.broker_cluster.clone(),
            port: self.broker_port,
            topic: self.topic.clone(),
            partitions: self.topic_partitions,
            replication: self.topic_replication,
            timeout: Duration::from_secs(self.broker_timeout_secs),
        }
    }
}

/// Labels and namespaces the ownership gate keys off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipPolicy {
    pub owner_label: String,
    pub priority_label: String,
    pub reserved_namespaces: BTreeSet<String>,
    pub publish_on_decode_failure: bool,
}

impl Default for OwnershipPolicy {
    fn default() -> Self {
        WebhookConfig::default().ownership_policy()
    }
}

impl OwnershipPolicy {
    /// Labels a non-owner may change freely
    pub fn is_exempt_label(&self, key: &str) -> bool {
        key == self.owner_label || key == self.priority_label
    }

    /// Whether the namespace belongs to the control plane
    pub fn is_reserved_namespace(&self, namespace: &str) -> bool {
        self.reserved_namespaces.contains(namespace)
    }
}

/// Where and how reconcile events are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub namespace: String,
    pub cluster: String,
    pub port: u16,
    pub topic: String,
    pub partitions: i32,
    pub replication: i16,
    pub timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        WebhookConfig::default().broker_config()
    }
}

impl BrokerConfig {
    /// Label selector matching the broker cluster's services
    pub fn label_selector(&self) -> String {
        format!("strimzi.io/cluster={},strimzi.io/kind=Kafka", self.cluster)
    }
}
