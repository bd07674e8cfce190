//! Kafka-backed reconcile queue.
//!
//! Every publish discovers brokers, connects, makes sure the topic exists and
//! sends one record. Nothing is held between calls, so concurrent requests
//! never share a producer. The configured timeout is one budget for the
//! whole publish; each network step only gets what the earlier steps left.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rskafka::client::error::{Error as KafkaError, ProtocolError};
use rskafka::client::partition::{Compression, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder};
use rskafka::record::Record;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::directory::BrokerDirectory;
use super::{ReconcileQueue, ResourceIdentity};
use crate::config::BrokerConfig;
use crate::error::PublishError;

/// Publishes reconcile events to a Kafka topic.
pub struct KafkaReconcileQueue<D> {
    directory: D,
    config: BrokerConfig,
}

impl<D: BrokerDirectory> KafkaReconcileQueue<D> {
    pub fn new(directory: D, config: BrokerConfig) -> Self {
        Self { directory, config }
    }

    async fn connect(&self, deadline: &Deadline) -> Result<Client, PublishError> {
        let endpoints = deadline
            .run("broker discovery", self.directory.discover())
            .await?;
        if endpoints.is_empty() {
            return Err(PublishError::NoBrokers {
                cluster: self.config.cluster.clone(),
                namespace: self.config.namespace.clone(),
            });
        }

        let brokers: Vec<String> = endpoints.iter().map(ToString::to_string).collect();
        info!(brokers = ?brokers, "Retrieved broker addresses");

        deadline
            .run("broker connect", async {
                ClientBuilder::new(brokers.clone())
                    .build()
                    .await
                    .map_err(|source| PublishError::Connect {
                        brokers: brokers.join(","),
                        source,
                    })
            })
            .await
    }

    async fn ensure_topic(&self, client: &Client, deadline: &Deadline) -> Result<(), PublishError> {
        let topic = &self.config.topic;
        let topic_error = |source: KafkaError| PublishError::Topic {
            topic: topic.clone(),
            source,
        };

        let topics = client.list_topics().await.map_err(topic_error)?;
        if topics.iter().any(|t| &t.name == topic) {
            debug!(topic = %topic, "Topic already exists");
            return Ok(());
        }

        let controller = client.controller_client().map_err(topic_error)?;
        let timeout_ms = i32::try_from(deadline.remaining().as_millis()).unwrap_or(i32::MAX);
        match controller
            .create_topic(
                topic.clone(),
                self.config.partitions,
                self.config.replication,
                timeout_ms,
            )
            .await
        {
            Ok(()) => {
                info!(
                    topic = %topic,
                    partitions = self.config.partitions,
                    replication = self.config.replication,
                    "Created topic"
                );
                Ok(())
            }
            // Another replica created it between the lookup and the create
            Err(KafkaError::ServerError {
                protocol_error: ProtocolError::TopicAlreadyExists,
                ..
            }) => Ok(()),
            Err(source) => Err(topic_error(source)),
        }
    }

    async fn send(
        &self,
        client: &Client,
        resource: &ResourceIdentity,
    ) -> Result<(), PublishError> {
        let topic = &self.config.topic;
        let send_error = |source: KafkaError| PublishError::Send {
            topic: topic.clone(),
            source,
        };

        let partition = partition_for(resource.message_id, self.config.partitions);
        let partition_client = client
            .partition_client(topic.clone(), partition, UnknownTopicHandling::Error)
            .await
            .map_err(send_error)?;

        let record = Record {
            key: Some(resource.message_id.to_string().into_bytes()),
            value: Some(resource.to_payload()?),
            headers: BTreeMap::new(),
            timestamp: Utc::now(),
        };

        let offsets = partition_client
            .produce(vec![record], Compression::NoCompression)
            .await
            .map_err(send_error)?;

        info!(
            topic = %topic,
            partition,
            offset = ?offsets.first(),
            message_id = %resource.message_id,
            "Sent message to broker"
        );
        Ok(())
    }
}

#[async_trait]
impl<D: BrokerDirectory> ReconcileQueue for KafkaReconcileQueue<D> {
    async fn publish(&self, resource: &ResourceIdentity) -> Result<(), PublishError> {
        let deadline = Deadline::after(self.config.timeout);
        let result = async {
            let client = self.connect(&deadline).await?;
            deadline
                .run("topic setup", self.ensure_topic(&client, &deadline))
                .await?;
            deadline
                .run("message send", self.send(&client, resource))
                .await
        }
        .await;

        if let Err(e) = &result {
            warn!(
                error = %e,
                retryable = e.is_retryable(),
                namespace = %resource.namespace,
                name = %resource.name,
                "Failed to queue resource for reconcile"
            );
        }
        result
    }
}

/// Stable partition for a message, spread by its correlation ID.
pub fn partition_for(message_id: Uuid, partitions: i32) -> i32 {
    let partitions = partitions.max(1) as u128;
    (message_id.as_u128() % partitions) as i32
}

/// Time budget shared by every network step of one publish.
struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Run one step, failing with a timeout once the shared budget is spent.
    async fn run<T, F>(&self, step: &'static str, fut: F) -> Result<T, PublishError>
    where
        F: Future<Output = Result<T, PublishError>>,
    {
        tokio::time::timeout_at(self.at, fut)
            .await
            .map_err(|_| PublishError::Timeout {
                step,
                after: self.budget,
            })?
    }
}
