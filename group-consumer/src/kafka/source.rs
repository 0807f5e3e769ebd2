//! Boundary traits between the consumer runtime and its collaborators.
//!
//! The runtime never talks to rdkafka directly: the poll side goes through
//! [`RecordSource`], commits through [`OffsetCommitter`], and the client
//! delivers rebalance events to a [`RebalanceListener`]. The kafka
//! implementations live in `kafka::client`, in-memory ones in
//! `kafka::test_utils`.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{CommitError, SourceError};
use crate::event::Message;
use crate::kafka::record::{PartitionBatch, Record};
use crate::kafka::types::TopicPartitions;

/// Result of one poll of the record source.
#[derive(Debug, Default)]
pub struct PollOutcome {
    /// One batch per partition that returned records, in fetch order
    pub batches: Vec<PartitionBatch>,
    /// The source was closed; the dispatch loop must exit
    pub closed: bool,
}

impl PollOutcome {
    pub fn closed() -> Self {
        Self {
            batches: Vec::new(),
            closed: true,
        }
    }

    pub fn record_count(&self) -> usize {
        self.batches.iter().map(PartitionBatch::len).sum()
    }
}

/// Poll side of the partitioned log.
///
/// Rebalance events are only delivered to the bound listener from inside
/// `poll_batches`, on the polling thread. Implementations must not start a
/// new poll while a listener callback is still running.
pub trait RecordSource: Send + Sync {
    /// Blocks until records are available, the poll timeout elapses or the
    /// source is closed. Returns at most `max_records` records.
    fn poll_batches(&self, max_records: usize) -> Result<PollOutcome, SourceError>;

    /// Called once every batch of the previous poll has been distributed.
    /// Rebalance events held back by the source may be delivered from the
    /// next poll onwards.
    fn allow_rebalance(&self);
}

/// Commit side of the partitioned log, shared by every partition worker.
pub trait OffsetCommitter: Send + Sync {
    /// Commit the position after the highest offset of each partition present
    /// in `records`.
    fn commit(&self, records: &[Record]) -> Result<(), CommitError>;
}

/// Receives group membership changes. Called on the polling thread; the
/// revoke and lost callbacks must not return before the partitions they name
/// are fully drained.
pub trait RebalanceListener: Send + Sync {
    fn on_assigned(&self, assigned: &TopicPartitions);

    fn on_revoked(&self, revoked: &TopicPartitions);

    fn on_lost(&self, lost: &TopicPartitions);
}

/// Application logic invoked once per decoded record.
///
/// One handler is shared by every partition of a subscription, so it must be
/// safe to run concurrently. `cancel` fires when the consumer shuts down.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, cancel: CancellationToken, message: Message) -> anyhow::Result<()>;
}
