use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::ClientConfig;
use tracing::info;

use crate::error::AdminError;

/// Partition layout a topic is created with when it does not exist yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i32,
}

impl TopicSpec {
    pub fn new(name: &str, partitions: i32, replication_factor: i32) -> Self {
        Self {
            name: name.to_owned(),
            partitions,
            replication_factor,
        }
    }
}

#[async_trait]
pub trait TopicAdmin: Send + Sync {
    async fn topic_exists(&self, topic: &str) -> Result<bool, AdminError>;

    /// Fails with `AdminError::AlreadyExists` if the topic is already there
    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), AdminError>;
}

/// Make sure the topic exists before the consumer starts. Returns true if
/// it was created by this call. An existing topic is never an error, even if
/// another instance created it between the check and the create.
pub async fn ensure_topic(admin: &dyn TopicAdmin, spec: &TopicSpec) -> Result<bool, AdminError> {
    if admin.topic_exists(&spec.name).await? {
        info!(topic = %spec.name, "Topic already exists");
        return Ok(false);
    }

    match admin.create_topic(spec).await {
        Ok(()) => {
            info!(
                topic = %spec.name,
                partitions = spec.partitions,
                replication_factor = spec.replication_factor,
                "Created topic"
            );
            Ok(true)
        }
        Err(AdminError::AlreadyExists { .. }) => {
            info!(topic = %spec.name, "Topic created concurrently");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

pub struct KafkaTopicAdmin {
    client: Arc<AdminClient<DefaultClientContext>>,
    timeout: Duration,
}

impl KafkaTopicAdmin {
    pub fn new(config: &ClientConfig, timeout: Duration) -> Result<Self, KafkaError> {
        let client: AdminClient<DefaultClientContext> = config.create()?;
        Ok(Self {
            client: Arc::new(client),
            timeout,
        })
    }
}

#[async_trait]
impl TopicAdmin for KafkaTopicAdmin {
    async fn topic_exists(&self, topic: &str) -> Result<bool, AdminError> {
        let client = self.client.clone();
        let timeout = self.timeout;
        let topic = topic.to_owned();

        // list every topic: asking for a single one can auto-create it
        let found = tokio::task::spawn_blocking(move || {
            let metadata = client.inner().fetch_metadata(None, timeout)?;
            Ok::<bool, KafkaError>(
                metadata
                    .topics()
                    .iter()
                    .any(|t| t.name() == topic && t.error().is_none()),
            )
        })
        .await
        .map_err(|_| AdminError::Kafka(KafkaError::Canceled))??;

        Ok(found)
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), AdminError> {
        let new_topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(spec.replication_factor),
        );
        let opts = AdminOptions::new().operation_timeout(Some(self.timeout));

        let results = self.client.create_topics(&[new_topic], &opts).await?;
        for result in results {
            match result {
                Ok(_) => {}
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    return Err(AdminError::AlreadyExists { topic });
                }
                Err((topic, code)) => {
                    return Err(AdminError::TopicCreation { topic, code });
                }
            }
        }
        Ok(())
    }
}
