use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::error::ServiceError;
use crate::kafka::admin::TopicSpec;
use crate::kafka::config::ConsumerConfigBuilder;
use crate::kafka::coordinator::CoordinatorConfig;
use crate::kafka::partition_worker::{CommitPolicy, PartitionWorkerConfig};
use crate::kafka::producer::producer_config;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(from = "POLL_MAX_RECORDS", default = "10000")]
    pub poll_max_records: usize,

    #[envconfig(from = "POLL_TIMEOUT", default = "100")]
    pub poll_timeout: EnvMsDuration,

    #[envconfig(from = "WORKER_QUEUE_DEPTH", default = "5")]
    pub worker_queue_depth: usize,

    #[envconfig(from = "COMMIT_POLICY", default = "after_dispatch")]
    pub commit_policy: CommitPolicy,

    /// Unset: a revoked partition is drained for as long as its handlers run
    #[envconfig(from = "REBALANCE_DRAIN_TIMEOUT")]
    pub rebalance_drain_timeout: Option<EnvMsDuration>,
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "gallery-service")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "product_created")]
    pub kafka_consumer_topic: String,

    /// Only consume this partition of the topic
    pub kafka_consumer_partition: Option<i32>,

    /// Set to join the group as a static member under this id
    pub kafka_client_id: Option<String>,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "3")]
    pub kafka_topic_partitions: i32,

    #[envconfig(default = "1")]
    pub kafka_topic_replication_factor: i32,

    #[envconfig(default = "52428800")]
    pub kafka_fetch_max_bytes: u32,

    #[envconfig(default = "1048576")]
    pub kafka_fetch_max_partition_bytes: u32,

    #[envconfig(default = "500")]
    pub kafka_fetch_max_wait_ms: u32,

    #[envconfig(default = "300000")]
    pub kafka_metadata_max_age_ms: u32,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject values the consumer cannot run with
    pub fn validate(&self) -> Result<(), ServiceError> {
        if let Some(partition) = self.kafka.kafka_consumer_partition {
            if partition < 0 {
                return Err(ServiceError::Config(format!(
                    "KAFKA_CONSUMER_PARTITION must not be negative, got {partition}"
                )));
            }
        }
        if self.worker_queue_depth == 0 {
            return Err(ServiceError::Config(
                "WORKER_QUEUE_DEPTH must be at least 1".to_owned(),
            ));
        }
        if self.poll_max_records == 0 {
            return Err(ServiceError::Config(
                "POLL_MAX_RECORDS must be at least 1".to_owned(),
            ));
        }
        if self.kafka.kafka_topic_partitions <= 0 {
            return Err(ServiceError::Config(
                "KAFKA_TOPIC_PARTITIONS must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn consumer_config(&self, group: &str) -> ClientConfig {
        ConsumerConfigBuilder::for_group_consumer(&self.kafka.kafka_hosts, group)
            .with_tls(self.kafka.kafka_tls)
            .with_offset_reset(&self.kafka.kafka_consumer_offset_reset)
            .with_sticky_partition_assignment(self.kafka.kafka_client_id.as_deref())
            .with_fetch_max_bytes(self.kafka.kafka_fetch_max_bytes)
            .with_max_partition_fetch_bytes(self.kafka.kafka_fetch_max_partition_bytes)
            .with_fetch_wait_max_ms(self.kafka.kafka_fetch_max_wait_ms)
            .with_metadata_max_age_ms(self.kafka.kafka_metadata_max_age_ms)
            .build()
    }

    pub fn admin_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.kafka.kafka_hosts);
        if self.kafka.kafka_tls {
            config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        config
    }

    pub fn producer_config(&self) -> ClientConfig {
        producer_config(&self.kafka.kafka_hosts, self.kafka.kafka_tls)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            fixed_partition: self.kafka.kafka_consumer_partition,
            drain_timeout: self.rebalance_drain_timeout.map(|d| d.0),
            worker: PartitionWorkerConfig {
                queue_depth: self.worker_queue_depth,
                commit_policy: self.commit_policy,
            },
        }
    }

    pub fn topic_spec(&self) -> TopicSpec {
        TopicSpec::new(
            &self.kafka.kafka_consumer_topic,
            self.kafka.kafka_topic_partitions,
            self.kafka.kafka_topic_replication_factor,
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
