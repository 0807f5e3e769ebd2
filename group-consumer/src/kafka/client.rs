//! rdkafka implementations of the record source and the committer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{error, info, warn};

use crate::error::{CommitError, SourceError};
use crate::kafka::context::GroupConsumerContext;
use crate::kafka::metrics_consts::{SOURCE_DISCARDED_RECORDS, SOURCE_POLL_ERRORS};
use crate::kafka::record::{discard_removed, group_into_batches, Record};
use crate::kafka::source::{OffsetCommitter, PollOutcome, RebalanceListener, RecordSource};
use crate::kafka::types::Partition;

pub type GroupConsumer = BaseConsumer<GroupConsumerContext>;

/// What the poll loop does after the kafka client returned an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollErrorAction {
    /// Log, back off and keep polling
    Retry { backoff: Duration },
    /// The client was shut down
    Closed,
    Fatal,
}

/// Classify a poll error. `streak` is the number of consecutive errors,
/// used to grow the backoff.
pub fn classify_poll_error(e: &KafkaError, streak: u64) -> PollErrorAction {
    match e {
        KafkaError::MessageConsumption(code) => match code {
            RDKafkaErrorCode::PartitionEOF | RDKafkaErrorCode::OperationTimedOut => {
                PollErrorAction::Retry {
                    backoff: Duration::ZERO,
                }
            }
            // "auto.offset.reset" will trigger a seek to head or tail
            RDKafkaErrorCode::OffsetOutOfRange => PollErrorAction::Retry {
                backoff: Duration::from_millis(500),
            },
            _ => PollErrorAction::Retry {
                backoff: Duration::from_millis(100 * streak.min(10)),
            },
        },
        KafkaError::MessageConsumptionFatal(_) => PollErrorAction::Fatal,
        KafkaError::Global(code) => match code {
            RDKafkaErrorCode::Authentication => PollErrorAction::Fatal,
            RDKafkaErrorCode::AllBrokersDown => PollErrorAction::Retry {
                backoff: Duration::from_secs(streak.min(5)),
            },
            RDKafkaErrorCode::BrokerTransportFailure => PollErrorAction::Retry {
                backoff: Duration::from_secs(streak.min(3)),
            },
            _ => PollErrorAction::Retry {
                backoff: Duration::from_millis(500 * streak.min(6)),
            },
        },
        KafkaError::Canceled => PollErrorAction::Closed,
        _ => PollErrorAction::Retry {
            backoff: Duration::from_millis(100 * streak.min(10)),
        },
    }
}

/// Record source backed by an rdkafka group consumer.
///
/// The consumer is polled with a blocking `BaseConsumer::poll`, so the
/// rebalance callbacks of [`GroupConsumerContext`] only ever run inside
/// `poll_batches`. `allow_rebalance` has nothing to release. A call returns
/// right after a rebalance, without the records it had already collected for
/// the revoked or lost partitions.
pub struct KafkaRecordSource {
    consumer: Arc<GroupConsumer>,
    poll_timeout: Duration,
    batch_ids: AtomicU64,
    error_streak: AtomicU64,
    closed: AtomicBool,
}

impl KafkaRecordSource {
    pub fn new(config: &ClientConfig, poll_timeout: Duration) -> Result<Self, KafkaError> {
        let consumer: GroupConsumer =
            config.create_with_context(GroupConsumerContext::default())?;

        Ok(Self {
            consumer: Arc::new(consumer),
            poll_timeout,
            batch_ids: AtomicU64::new(1),
            error_streak: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Deliver rebalance events to `listener`. Must happen before the first
    /// poll; returns false if a listener was already bound.
    pub fn bind(&self, listener: Arc<dyn RebalanceListener>) -> bool {
        self.consumer.context().bind(listener)
    }

    pub fn subscribe(&self, topic: &str) -> Result<(), SourceError> {
        self.consumer.subscribe(&[topic])?;
        info!(topic = topic, "Subscribed to topic");
        Ok(())
    }

    /// A committer sharing this client. It does not keep the client alive:
    /// once the source is dropped, commits fail with `ClientGone`.
    pub fn committer(&self) -> KafkaCommitter {
        KafkaCommitter {
            consumer: Arc::downgrade(&self.consumer),
        }
    }

    /// Leave the group. The next poll reports the source as closed.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.consumer.unsubscribe();
        info!("Record source closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl RecordSource for KafkaRecordSource {
    fn poll_batches(&self, max_records: usize) -> Result<PollOutcome, SourceError> {
        if self.is_closed() {
            return Ok(PollOutcome::closed());
        }
        let context = self.consumer.context();
        if !context.is_bound() {
            return Err(SourceError::NotSubscribed);
        }

        let epoch = context.rebalance_epoch();
        let mut records = Vec::new();
        let mut timeout = self.poll_timeout;

        while records.len() < max_records {
            let polled = self.consumer.poll(timeout);

            // records fetched before a revoke must not reach the next owner
            let rebalanced = context.rebalance_epoch() != epoch;
            if rebalanced {
                let removed = context.take_removed();
                let discarded = discard_removed(&mut records, &removed);
                if discarded > 0 {
                    warn!(
                        discarded,
                        partitions = removed.len(),
                        "Discarded records fetched before their partitions were revoked"
                    );
                    metrics::counter!(SOURCE_DISCARDED_RECORDS).increment(discarded as u64);
                }
            }

            match polled {
                None => break,
                Some(Ok(message)) => {
                    records.push(Record::from_borrowed_message(&message));
                    self.error_streak.store(0, Ordering::SeqCst);
                    // only drain what is already fetched after the first record
                    timeout = Duration::ZERO;
                }
                Some(Err(e)) => {
                    let streak = self.error_streak.fetch_add(1, Ordering::SeqCst) + 1;
                    match classify_poll_error(&e, streak) {
                        PollErrorAction::Retry { backoff } => {
                            warn!("Kafka consumer error: {e}");
                            metrics::counter!(SOURCE_POLL_ERRORS, "level" => "warn")
                                .increment(1);
                            std::thread::sleep(backoff);
                            break;
                        }
                        PollErrorAction::Closed => {
                            info!("Consumer canceled, closing record source");
                            self.closed.store(true, Ordering::SeqCst);
                            break;
                        }
                        PollErrorAction::Fatal => {
                            error!("Fatal Kafka consumer error: {e}");
                            metrics::counter!(SOURCE_POLL_ERRORS, "level" => "fatal")
                                .increment(1);
                            return Err(SourceError::Kafka(e));
                        }
                    }
                }
            }

            if rebalanced {
                break;
            }
        }

        // records fetched before a cancel are dropped: they were never committed
        if self.is_closed() {
            return Ok(PollOutcome::closed());
        }

        Ok(PollOutcome {
            batches: group_into_batches(records, &self.batch_ids),
            closed: false,
        })
    }

    fn allow_rebalance(&self) {}
}

/// Next offset to commit per partition: the highest offset seen plus one.
pub fn next_offsets(records: &[Record]) -> BTreeMap<Partition, i64> {
    let mut offsets: BTreeMap<Partition, i64> = BTreeMap::new();
    for record in records {
        let next = record.offset() + 1;
        offsets
            .entry(record.partition().clone())
            .and_modify(|o| *o = (*o).max(next))
            .or_insert(next);
    }
    offsets
}

/// Commits through the consumer of a [`KafkaRecordSource`].
#[derive(Clone)]
pub struct KafkaCommitter {
    consumer: Weak<GroupConsumer>,
}

impl OffsetCommitter for KafkaCommitter {
    fn commit(&self, records: &[Record]) -> Result<(), CommitError> {
        let offsets = next_offsets(records);
        if offsets.is_empty() {
            return Ok(());
        }
        let consumer = self.consumer.upgrade().ok_or(CommitError::ClientGone)?;

        let mut list = TopicPartitionList::new();
        for (partition, next_offset) in &offsets {
            list.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(*next_offset),
            )?;
        }

        // synchronous so the worker knows the position was accepted
        consumer.commit(&list, CommitMode::Sync)?;
        Ok(())
    }
}
