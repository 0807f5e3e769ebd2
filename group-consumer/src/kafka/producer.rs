use std::time::Duration;

use chrono::Utc;
use health::HealthHandle;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::{debug, info};

use crate::error::ProduceError;
use crate::event::EventEnvelope;
use crate::kafka::metrics_consts::PRODUCED_EVENTS;

pub struct ProducerContext {
    liveness: Option<HealthHandle>,
}

impl rdkafka::ClientContext for ProducerContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }
    }
}

/// Producer settings: every event is acknowledged by all in-sync replicas
/// and batches are lz4 compressed.
pub fn producer_config(kafka_hosts: &str, tls: bool) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("acks", "all")
        .set("compression.codec", "lz4")
        .set("linger.ms", "20")
        .set("message.timeout.ms", "20000");

    if tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };
    client_config
}

/// Key used when the caller has none: unique enough to spread events over
/// partitions.
pub fn generated_key() -> String {
    format!("key-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

/// Publishes event envelopes to one topic as JSON.
pub struct EventProducer {
    producer: FutureProducer<ProducerContext>,
    topic: String,
}

impl EventProducer {
    pub fn new(
        client_config: &ClientConfig,
        topic: &str,
        liveness: Option<HealthHandle>,
    ) -> Result<Self, KafkaError> {
        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<ProducerContext> =
            client_config.create_with_context(ProducerContext { liveness })?;
        info!(topic = topic, "Created event producer");

        Ok(Self {
            producer,
            topic: topic.to_owned(),
        })
    }

    /// Publish with a generated key
    pub async fn send(&self, envelope: &EventEnvelope) -> Result<(), ProduceError> {
        self.send_with_key(&generated_key(), envelope).await
    }

    /// Publish and wait for the broker acknowledgement. Events with the same
    /// key land on the same partition.
    pub async fn send_with_key(&self, key: &str, envelope: &EventEnvelope) -> Result<(), ProduceError> {
        let payload = serde_json::to_vec(envelope)?;
        let record = FutureRecord::to(&self.topic).key(key).payload(&payload);

        let delivery = match self.producer.send_result(record) {
            Ok(delivery) => delivery,
            Err((e, _)) => {
                metrics::counter!(PRODUCED_EVENTS, "outcome" => "rejected").increment(1);
                return Err(ProduceError::Kafka(e));
            }
        };

        match delivery.await {
            Ok(Ok(_)) => {
                metrics::counter!(PRODUCED_EVENTS, "outcome" => "success").increment(1);
                Ok(())
            }
            Ok(Err((e, _))) => {
                metrics::counter!(PRODUCED_EVENTS, "outcome" => "failed").increment(1);
                Err(ProduceError::Kafka(e))
            }
            Err(_) => {
                metrics::counter!(PRODUCED_EVENTS, "outcome" => "canceled").increment(1);
                Err(ProduceError::Canceled)
            }
        }
    }

    pub fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.producer.flush(Timeout::After(timeout))
    }
}
