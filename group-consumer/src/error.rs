use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

use crate::kafka::types::Partition;

/// A record payload could not be turned into an event envelope.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("record has no payload")]
    EmptyPayload,
    #[error("payload is not a valid event envelope")]
    Json(#[from] serde_json::Error),
}

/// An offset commit was rejected or could not be attempted.
#[derive(Error, Debug)]
pub enum CommitError {
    #[error("kafka rejected the offset commit")]
    Kafka(#[from] KafkaError),
    #[error("consumer client is gone")]
    ClientGone,
}

/// Errors surfaced to the application on the shared error channel.
///
/// Only handler and commit failures are reported here; everything else is
/// logged where it happens.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("handler failed for {partition} at offset {offset}")]
    Handler {
        partition: Partition,
        offset: i64,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to commit offset {next_offset} for {partition}")]
    Commit {
        partition: Partition,
        next_offset: i64,
        #[source]
        source: CommitError,
    },
}

impl ConsumerError {
    pub fn partition(&self) -> &Partition {
        match self {
            ConsumerError::Handler { partition, .. } => partition,
            ConsumerError::Commit { partition, .. } => partition,
        }
    }
}

/// Terminal failures of the record source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("fatal kafka consumer error")]
    Kafka(#[from] KafkaError),
    #[error("record source polled before a rebalance listener was bound")]
    NotSubscribed,
}

#[derive(Error, Debug)]
pub enum AdminError {
    #[error("kafka admin request failed")]
    Kafka(#[from] KafkaError),
    #[error("topic {topic} already exists")]
    AlreadyExists { topic: String },
    #[error("unable to create topic {topic}: {code}")]
    TopicCreation {
        topic: String,
        code: RDKafkaErrorCode,
    },
}

#[derive(Error, Debug)]
pub enum ProduceError {
    #[error("failed to serialize event")]
    Serialize(#[from] serde_json::Error),
    #[error("kafka rejected the event")]
    Kafka(#[from] KafkaError),
    #[error("delivery was canceled before an acknowledgement arrived")]
    Canceled,
}

/// Startup and lifecycle failures of a consumer service.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("topic bootstrap failed")]
    Admin(#[from] AdminError),
    #[error("failed to create kafka client")]
    Kafka(#[from] KafkaError),
    #[error("record source failed")]
    Source(#[from] SourceError),
    #[error("consumer task failed")]
    Join(#[from] tokio::task::JoinError),
}
