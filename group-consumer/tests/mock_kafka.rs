use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use envconfig::Envconfig;
use group_consumer::config::Config;
use group_consumer::error::AdminError;
use group_consumer::event::EventEnvelope;
use group_consumer::kafka::admin::{ensure_topic, KafkaTopicAdmin, TopicAdmin, TopicSpec};
use group_consumer::kafka::client::KafkaRecordSource;
use group_consumer::kafka::config::ConsumerConfigBuilder;
use group_consumer::kafka::coordinator::CoordinatorConfig;
use group_consumer::kafka::producer::{producer_config, EventProducer};
use group_consumer::kafka::test_utils::RecordingHandler;
use group_consumer::kafka::types::Partition;
use group_consumer::service::{ConsumerJob, ConsumerService, JobRun};
use health::HealthRegistry;
use rdkafka::error::KafkaError;
use rdkafka::mocking::MockCluster;
use rdkafka::producer::DefaultProducerContext;
use rdkafka::ClientConfig;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "product_created";

fn create_mock_kafka() -> MockCluster<'static, DefaultProducerContext> {
    let cluster = MockCluster::new(1).expect("failed to create mock brokers");
    cluster
        .create_topic(TOPIC, 2, 1)
        .expect("failed to create mock topic");
    cluster
}

fn admin_config(hosts: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", hosts);
    config
}

type CreateRequest = (TopicSpec, oneshot::Sender<()>);

/// The mock cluster does not implement topic creation. Existence checks go
/// through the kafka admin client, creations are handed to the test owning
/// the cluster.
struct MockClusterAdmin {
    kafka: KafkaTopicAdmin,
    creates: mpsc::UnboundedSender<CreateRequest>,
}

#[async_trait]
impl TopicAdmin for MockClusterAdmin {
    async fn topic_exists(&self, topic: &str) -> Result<bool, AdminError> {
        self.kafka.topic_exists(topic).await
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), AdminError> {
        let (done, created) = oneshot::channel();
        self.creates
            .send((spec.clone(), done))
            .map_err(|_| AdminError::Kafka(KafkaError::Canceled))?;
        created
            .await
            .map_err(|_| AdminError::Kafka(KafkaError::Canceled))
    }
}

async fn produce_products(hosts: &str, topic: &str, count: usize) {
    let mut config = producer_config(hosts, false);
    config.set("compression.codec", "none");
    let producer = EventProducer::new(&config, topic, None).unwrap();

    for i in 0..count {
        let mut envelope = EventEnvelope::new("product_created");
        envelope
            .set_json_data(&json!({"id": format!("p-{i}"), "name": "lamp"}))
            .unwrap();
        producer.send_with_key("same-product", &envelope).await.unwrap();
    }
    producer.flush(Duration::from_secs(5)).unwrap();
}

/// Group joins on the mock cluster take a few seconds
async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_existing_topic_is_not_recreated() {
    let cluster = create_mock_kafka();
    let admin = KafkaTopicAdmin::new(
        &admin_config(&cluster.bootstrap_servers()),
        Duration::from_secs(5),
    )
    .unwrap();

    assert!(admin.topic_exists(TOPIC).await.unwrap());
    assert!(!admin.topic_exists("missing_topic").await.unwrap());

    let created = ensure_topic(&admin, &TopicSpec::new(TOPIC, 2, 1))
        .await
        .unwrap();
    assert!(!created);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_produced_events_reach_the_handler_in_order() {
    let cluster = create_mock_kafka();
    let hosts = cluster.bootstrap_servers();

    produce_products(&hosts, TOPIC, 5).await;

    let mut config = producer_config(&hosts, false);
    config.set("compression.codec", "none");
    let producer = EventProducer::new(&config, TOPIC, None).unwrap();
    producer
        .send(&EventEnvelope::new("product_deleted"))
        .await
        .unwrap();
    producer.flush(Duration::from_secs(5)).unwrap();

    let consumer_config = ConsumerConfigBuilder::for_group_consumer(&hosts, "test-group")
        .with_offset_reset("earliest")
        .with_session_timeout_ms(10000)
        .build();
    let source =
        Arc::new(KafkaRecordSource::new(&consumer_config, Duration::from_millis(100)).unwrap());

    let handler = Arc::new(RecordingHandler::default());
    let job = ConsumerJob::new("mock-kafka", "test-group", handler.clone());
    let cancel = CancellationToken::new();
    let run = JobRun::new(
        &job,
        source.clone(),
        Arc::new(source.committer()),
        CoordinatorConfig::default(),
        100,
        &cancel,
    );
    assert!(source.bind(run.coordinator()));
    source.subscribe(TOPIC).unwrap();
    let running = tokio::spawn(run.run());

    wait_for("all events handled", || handler.completed() >= 6).await;

    // per partition, records are handled in offset order
    for partition in 0..2 {
        let offsets = handler.offsets_for(&Partition::new(TOPIC, partition));
        let mut sorted = offsets.clone();
        sorted.sort();
        assert_eq!(offsets, sorted);
    }

    cancel.cancel();
    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.dispatch.records, 6);
    assert_eq!(summary.errors_reported, 0);

    tokio::task::spawn_blocking(move || {
        source.close();
        drop(source);
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_service_creates_a_missing_topic_before_consuming() {
    let cluster = MockCluster::new(1).expect("failed to create mock brokers");
    let hosts = cluster.bootstrap_servers();
    let topic = "gallery_events";

    let (creates_tx, mut creates) = mpsc::unbounded_channel();
    let admin = Arc::new(MockClusterAdmin {
        kafka: KafkaTopicAdmin::new(&admin_config(&hosts), Duration::from_secs(5)).unwrap(),
        creates: creates_tx,
    });
    assert!(!admin.topic_exists(topic).await.unwrap());

    let env: HashMap<String, String> = [
        ("KAFKA_HOSTS", hosts.as_str()),
        ("KAFKA_CONSUMER_TOPIC", topic),
        ("KAFKA_CONSUMER_GROUP", "gallery-test"),
        ("KAFKA_TOPIC_PARTITIONS", "2"),
        ("POLL_MAX_RECORDS", "100"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_owned(), v.to_owned()))
    .collect();
    let config = Config::init_from_hashmap(&env).unwrap();
    config.validate().unwrap();

    let service = ConsumerService::new(config, HealthRegistry::new("liveness"))
        .with_topic_admin(admin.clone());
    let handler = Arc::new(RecordingHandler::default());
    let job = ConsumerJob::new("gallery", "gallery-test", handler.clone());
    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let cancel = cancel.clone();
        async move { service.run(job, cancel).await }
    });

    // the service asks for the topic before it joins the group
    let (spec, done) = tokio::time::timeout(Duration::from_secs(10), creates.recv())
        .await
        .expect("topic creation was not requested")
        .expect("admin dropped");
    assert_eq!(spec, TopicSpec::new(topic, 2, 1));
    cluster
        .create_topic(&spec.name, spec.partitions, spec.replication_factor)
        .expect("failed to create mock topic");
    done.send(()).unwrap();
    assert!(admin.topic_exists(topic).await.unwrap());

    produce_products(&hosts, topic, 3).await;
    wait_for("produced events handled", || handler.completed() >= 3).await;

    cancel.cancel();
    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.dispatch.records, 3);
    assert_eq!(summary.errors_reported, 0);
    // created once, never again
    assert!(creates.try_recv().is_err());
}
