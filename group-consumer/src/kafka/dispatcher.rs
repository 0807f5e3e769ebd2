//! Poll/Dispatch Loop - the single loop feeding every partition worker
//!
//! Runs on a dedicated blocking thread. Rebalance callbacks are delivered by
//! the record source on this same thread, from inside `poll_batches`, so a
//! poll's batches are always fully distributed before ownership can change.

use std::sync::Arc;

use health::HealthHandle;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ServiceError, SourceError};
use crate::kafka::coordinator::AssignmentCoordinator;
use crate::kafka::metrics_consts::{
    DISPATCH_BACKPRESSURE, DISPATCH_POLLS, DISPATCH_RECORDS, DISPATCH_UNOWNED_BATCHES,
};
use crate::kafka::record::PartitionBatch;
use crate::kafka::source::RecordSource;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub polls: u64,
    pub records: u64,
    pub batches_routed: u64,
    pub batches_dropped: u64,
}

pub struct DispatchLoop {
    source: Arc<dyn RecordSource>,
    coordinator: Arc<AssignmentCoordinator>,
    max_records: usize,
    liveness: Option<HealthHandle>,
}

impl DispatchLoop {
    pub fn new(
        source: Arc<dyn RecordSource>,
        coordinator: Arc<AssignmentCoordinator>,
        max_records: usize,
    ) -> Self {
        Self {
            source,
            coordinator,
            max_records,
            liveness: None,
        }
    }

    /// Report healthy to `liveness` after every poll iteration
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Run the loop on the blocking pool until cancelled, the source closes
    /// or it fails.
    pub async fn run(self, cancel: CancellationToken) -> Result<DispatchStats, ServiceError> {
        let stats = tokio::task::spawn_blocking(move || self.run_blocking(&cancel)).await??;
        Ok(stats)
    }

    /// The loop itself. Blocks the calling thread.
    pub fn run_blocking(&self, cancel: &CancellationToken) -> Result<DispatchStats, SourceError> {
        info!(max_records = self.max_records, "Starting dispatch loop");
        let mut stats = DispatchStats::default();

        loop {
            if cancel.is_cancelled() {
                info!("Dispatch loop cancelled");
                break;
            }

            let outcome = self.source.poll_batches(self.max_records)?;
            stats.polls += 1;
            metrics::counter!(DISPATCH_POLLS).increment(1);

            if outcome.closed {
                info!("Record source closed, dispatch loop exiting");
                break;
            }

            let record_count = outcome.record_count();
            stats.records += record_count as u64;
            metrics::counter!(DISPATCH_RECORDS).increment(record_count as u64);

            for batch in outcome.batches {
                if self.dispatch(batch) {
                    stats.batches_routed += 1;
                } else {
                    stats.batches_dropped += 1;
                }
            }

            // everything of this poll is distributed, ownership may change now
            self.source.allow_rebalance();

            if let Some(liveness) = &self.liveness {
                liveness.report_healthy();
            }
        }

        info!(
            polls = stats.polls,
            records = stats.records,
            batches_routed = stats.batches_routed,
            batches_dropped = stats.batches_dropped,
            "Dispatch loop stopped"
        );
        Ok(stats)
    }

    /// Hand a batch to the worker owning its partition, waiting for room in
    /// its queue. Returns false if the batch was dropped.
    fn dispatch(&self, batch: PartitionBatch) -> bool {
        let Some(sender) = self.coordinator.worker_sender(&batch.partition) else {
            warn!(
                topic = batch.partition.topic(),
                partition = batch.partition.partition_number(),
                batch_id = batch.batch_id,
                records = batch.len(),
                "No worker owns the partition, dropping batch"
            );
            metrics::counter!(DISPATCH_UNOWNED_BATCHES).increment(1);
            return false;
        };

        let batch = match sender.try_send(batch) {
            Ok(()) => return true,
            Err(TrySendError::Full(batch)) => batch,
            Err(TrySendError::Closed(batch)) => {
                warn!(
                    topic = batch.partition.topic(),
                    partition = batch.partition.partition_number(),
                    batch_id = batch.batch_id,
                    "Partition worker is gone, dropping batch"
                );
                return false;
            }
        };

        debug!(
            topic = batch.partition.topic(),
            partition = batch.partition.partition_number(),
            batch_id = batch.batch_id,
            "Worker queue full, waiting"
        );
        metrics::counter!(DISPATCH_BACKPRESSURE).increment(1);

        match sender.blocking_send(batch) {
            Ok(()) => true,
            Err(err) => {
                let batch = err.0;
                warn!(
                    topic = batch.partition.topic(),
                    partition = batch.partition.partition_number(),
                    batch_id = batch.batch_id,
                    "Partition worker is gone, dropping batch"
                );
                false
            }
        }
    }
}
