// Kafka module - partition workers fed by a single poll loop
pub mod admin;
pub mod client;
pub mod commit;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod dispatcher;
pub mod metrics_consts;
pub mod partition_worker;
pub mod producer;
pub mod record;
pub mod source;
pub mod types;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;

// Public API
pub use client::KafkaRecordSource;
pub use config::ConsumerConfigBuilder;
pub use coordinator::AssignmentCoordinator;
pub use partition_worker::CommitPolicy;
pub use producer::EventProducer;
pub use source::{MessageHandler, OffsetCommitter, RebalanceListener, RecordSource};
