//! Partitioned consumer-group runtime.
//!
//! A consumer instance joins a Kafka consumer group, runs one worker task per
//! partition it is assigned, and drains a partition's in-flight work before
//! giving it up on rebalance. See [`service::ConsumerService`] for the wiring.
//!
//! Log errors with `{e:#}` or `error = ?e` so the source chain is visible.

pub mod config;
pub mod error;
pub mod event;
pub mod handlers;
pub mod kafka;
pub mod metrics;
pub mod service;

pub use event::{EventEnvelope, Message};
pub use service::{ConsumerJob, ConsumerService};
