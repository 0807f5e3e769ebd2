//! Commit Manager - advances the committed position of one partition
//!
//! Each partition worker owns one manager. The manager commits whole
//! batches through the shared [`OffsetCommitter`] and keeps a cursor so the
//! committed position of the partition only ever moves forward.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{CommitError, ConsumerError};
use crate::kafka::metrics_consts::{COMMITS, COMMITTED_OFFSET};
use crate::kafka::record::Record;
use crate::kafka::source::OffsetCommitter;
use crate::kafka::types::Partition;

/// Positions of one partition, both expressed as "next offset to consume".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitCursor {
    /// Position after the last batch handed to handlers
    pub dispatched: Option<i64>,
    /// Position last accepted by the broker
    pub committed: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { next_offset: i64 },
    /// The batch would not move the committed position forward
    Skipped { next_offset: i64 },
    Empty,
    Failed { next_offset: i64 },
}

pub struct CommitManager {
    partition: Partition,
    committer: Arc<dyn OffsetCommitter>,
    errors: mpsc::UnboundedSender<ConsumerError>,
    cursor: CommitCursor,
}

impl CommitManager {
    pub fn new(
        partition: Partition,
        committer: Arc<dyn OffsetCommitter>,
        errors: mpsc::UnboundedSender<ConsumerError>,
    ) -> Self {
        Self {
            partition,
            committer,
            errors,
            cursor: CommitCursor::default(),
        }
    }

    pub fn cursor(&self) -> CommitCursor {
        self.cursor
    }

    /// Commit a dispatched batch. The commit call itself runs on the blocking
    /// pool since the kafka client waits for the broker to acknowledge it.
    ///
    /// Failures are logged, counted and reported on the error channel. They
    /// are never retried: the next batch commits a higher position anyway.
    pub async fn commit_batch(&mut self, batch_id: u64, records: Vec<Record>) -> CommitOutcome {
        let Some(max_offset) = records
            .iter()
            .filter(|r| r.partition() == &self.partition)
            .map(Record::offset)
            .max()
        else {
            return CommitOutcome::Empty;
        };
        let next_offset = max_offset + 1;

        let dispatched = self
            .cursor
            .dispatched
            .map_or(next_offset, |d| d.max(next_offset));
        self.cursor.dispatched = Some(dispatched);

        if self.cursor.committed.is_some_and(|c| next_offset <= c) {
            debug!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                batch_id = batch_id,
                next_offset = next_offset,
                committed = ?self.cursor.committed,
                "Skipping commit that would not advance the partition"
            );
            metrics::counter!(COMMITS, "outcome" => "skipped").increment(1);
            return CommitOutcome::Skipped { next_offset };
        }

        let committer = self.committer.clone();
        let result = match tokio::task::spawn_blocking(move || committer.commit(&records)).await {
            Ok(result) => result,
            Err(join_error) => {
                warn!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    "Commit task failed: {join_error}"
                );
                Err(CommitError::ClientGone)
            }
        };

        match result {
            Ok(()) => {
                self.cursor.committed = Some(next_offset);
                debug!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    batch_id = batch_id,
                    next_offset = next_offset,
                    "Committed batch"
                );
                metrics::counter!(COMMITS, "outcome" => "success").increment(1);
                metrics::gauge!(
                    COMMITTED_OFFSET,
                    "topic" => self.partition.topic().to_string(),
                    "partition" => self.partition.partition_number().to_string()
                )
                .set(next_offset as f64);
                CommitOutcome::Committed { next_offset }
            }
            Err(e) => {
                warn!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    batch_id = batch_id,
                    next_offset = next_offset,
                    "Failed to commit batch: {e}"
                );
                metrics::counter!(COMMITS, "outcome" => "failure").increment(1);
                let reported = self.errors.send(ConsumerError::Commit {
                    partition: self.partition.clone(),
                    next_offset,
                    source: e,
                });
                if reported.is_err() {
                    debug!(next_offset = next_offset, "Error channel closed, commit error dropped");
                }
                CommitOutcome::Failed { next_offset }
            }
        }
    }
}
