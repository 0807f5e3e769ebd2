//! Partition Worker - Dedicated worker for the records of a single partition
//!
//! Each assigned partition gets its own worker task with a bounded inbound
//! queue, ensuring:
//! 1. Batches of a partition are processed in fetch order
//! 2. Partitions are processed in parallel
//! 3. The dispatch loop is held back when a partition falls behind
//!
//! Handler invocations are spawned per record. On quit the worker stops
//! taking batches, waits for its in-flight handlers and then stops; the
//! completion of its task is the "done" signal the coordinator waits on.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::ConsumerError;
use crate::kafka::commit::{CommitManager, CommitOutcome};
use crate::kafka::metrics_consts::{
    WORKER_DECODE_ERRORS, WORKER_DISCARDED_BATCHES, WORKER_HANDLER_DURATION,
    WORKER_HANDLER_ERRORS, WORKER_RECORDS_DISPATCHED,
};
use crate::kafka::record::PartitionBatch;
use crate::kafka::source::{MessageHandler, OffsetCommitter};
use crate::kafka::types::Partition;

/// When the batch is committed relative to its handler invocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Commit as soon as every record of the batch has been handed to the
    /// handler. A crash can lose records whose handler had not finished.
    #[default]
    AfterDispatch,
    /// Wait for every handler invocation of the batch, then commit.
    /// Lower throughput, no loss on crash.
    AfterCompletion,
}

impl FromStr for CommitPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "after_dispatch" => Ok(CommitPolicy::AfterDispatch),
            "after_completion" => Ok(CommitPolicy::AfterCompletion),
            other => Err(format!(
                "unknown commit policy {other}, expected after_dispatch or after_completion"
            )),
        }
    }
}

impl fmt::Display for CommitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitPolicy::AfterDispatch => write!(f, "after_dispatch"),
            CommitPolicy::AfterCompletion => write!(f, "after_completion"),
        }
    }
}

/// Lifecycle of a worker, observable through [`PartitionWorker::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for the next batch
    Idle,
    /// Dispatching and committing a batch
    Consuming,
    /// Quit received: queued batches are discarded, in-flight handlers awaited
    Draining,
    Stopped,
}

/// Configuration for partition workers
#[derive(Debug, Clone)]
pub struct PartitionWorkerConfig {
    /// Number of batches buffered per partition before the dispatch loop blocks
    pub queue_depth: usize,
    pub commit_policy: CommitPolicy,
}

impl Default for PartitionWorkerConfig {
    fn default() -> Self {
        Self {
            queue_depth: 5,
            commit_policy: CommitPolicy::AfterDispatch,
        }
    }
}

/// What every worker of a consumer instance shares.
#[derive(Clone)]
pub struct WorkerContext {
    pub handler: Arc<dyn MessageHandler>,
    pub committer: Arc<dyn OffsetCommitter>,
    pub errors: mpsc::UnboundedSender<ConsumerError>,
    /// Runtime cancellation of the consumer instance
    pub cancel: CancellationToken,
}

/// A worker that processes the batches of a single partition
pub struct PartitionWorker {
    partition: Partition,
    sender: mpsc::Sender<PartitionBatch>,
    quit: CancellationToken,
    state: watch::Receiver<WorkerState>,
    handle: JoinHandle<()>,
}

impl PartitionWorker {
    /// Create the worker and start its loop on `runtime`
    pub fn spawn(
        partition: Partition,
        context: &WorkerContext,
        config: &PartitionWorkerConfig,
        runtime: &Handle,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_depth.max(1));
        let (state_tx, state) = watch::channel(WorkerState::Idle);
        // cancelled on revocation, and with the whole consumer instance
        let quit = context.cancel.child_token();

        let run = WorkerLoop {
            commits: CommitManager::new(
                partition.clone(),
                context.committer.clone(),
                context.errors.clone(),
            ),
            partition: partition.clone(),
            context: context.clone(),
            commit_policy: config.commit_policy,
            in_flight: TaskTracker::new(),
            state: state_tx,
        };
        let handle = runtime.spawn(run.run(receiver, quit.clone()));

        Self {
            partition,
            sender,
            quit,
            state,
            handle,
        }
    }

    /// Get a clone of the sender for use outside of DashMap guards
    pub fn sender(&self) -> mpsc::Sender<PartitionBatch> {
        self.sender.clone()
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Close the quit signal. The worker finishes its current batch, drains
    /// and stops; await [`PartitionWorker::into_done`] to observe it.
    pub fn quit(&self) {
        self.quit.cancel();
    }

    /// The partition and the handle that completes once the worker stopped
    pub fn into_done(self) -> (Partition, JoinHandle<()>) {
        (self.partition, self.handle)
    }

    /// Quit and wait until the worker has fully drained
    pub async fn shutdown(self) {
        self.quit();
        let (partition, handle) = self.into_done();
        if let Err(e) = handle.await {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Partition worker panicked during shutdown: {e}"
            );
        }
    }
}

struct WorkerLoop {
    partition: Partition,
    context: WorkerContext,
    commits: CommitManager,
    commit_policy: CommitPolicy,
    in_flight: TaskTracker,
    state: watch::Sender<WorkerState>,
}

impl WorkerLoop {
    async fn run(mut self, mut receiver: mpsc::Receiver<PartitionBatch>, quit: CancellationToken) {
        info!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            "Starting partition worker"
        );

        loop {
            tokio::select! {
                biased;
                _ = quit.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(batch) => {
                        self.state.send_replace(WorkerState::Consuming);
                        self.process_batch(batch).await;
                        self.state.send_replace(WorkerState::Idle);
                    }
                    None => break,
                },
            }
        }

        self.state.send_replace(WorkerState::Draining);

        // batches still queued were never dispatched nor committed
        receiver.close();
        let mut discarded = 0u64;
        while receiver.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            metrics::counter!(WORKER_DISCARDED_BATCHES).increment(discarded);
        }

        self.in_flight.close();
        let in_flight = self.in_flight.len();
        self.in_flight.wait().await;

        self.state.send_replace(WorkerState::Stopped);
        info!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            discarded_batches = discarded,
            awaited_handlers = in_flight,
            "Partition worker stopped"
        );
    }

    async fn process_batch(&mut self, batch: PartitionBatch) {
        let PartitionBatch {
            partition,
            records,
            batch_id,
        } = batch;

        debug!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            batch_id = batch_id,
            record_count = records.len(),
            first_offset = ?records.first().map(|r| r.offset()),
            last_offset = ?records.last().map(|r| r.offset()),
            "Processing batch"
        );

        let mut dispatched = Vec::with_capacity(records.len());
        for record in &records {
            let message = match record.to_message() {
                Ok(message) => message,
                Err(e) => {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        offset = record.offset(),
                        "Skipping record with undecodable payload: {e}"
                    );
                    metrics::counter!(WORKER_DECODE_ERRORS).increment(1);
                    continue;
                }
            };

            let handler = self.context.handler.clone();
            let cancel = self.context.cancel.clone();
            let errors = self.context.errors.clone();
            let offset = record.offset();
            let record_partition = partition.clone();

            dispatched.push(self.in_flight.spawn(async move {
                let start = Instant::now();
                let result = handler.handle(cancel, message).await;
                metrics::histogram!(WORKER_HANDLER_DURATION)
                    .record(start.elapsed().as_secs_f64());

                if let Err(source) = result {
                    metrics::counter!(WORKER_HANDLER_ERRORS).increment(1);
                    let reported = errors.send(ConsumerError::Handler {
                        partition: record_partition,
                        offset,
                        source,
                    });
                    if reported.is_err() {
                        debug!(offset = offset, "Error channel closed, handler error dropped");
                    }
                }
            }));
        }
        metrics::counter!(WORKER_RECORDS_DISPATCHED).increment(dispatched.len() as u64);

        if self.commit_policy == CommitPolicy::AfterCompletion {
            for result in join_all(dispatched).await {
                if let Err(e) = result {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        batch_id = batch_id,
                        "Handler task panicked: {e}"
                    );
                }
            }
        }

        if let CommitOutcome::Failed { next_offset } =
            self.commits.commit_batch(batch_id, records).await
        {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                next_offset = next_offset,
                "Continuing after failed commit"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::event::EventEnvelope;
    use crate::kafka::record::Record;
    use crate::kafka::test_utils::{envelope_payload, RecordingCommitter, RecordingHandler};

    fn batch(partition: &Partition, offsets: &[i64], batch_id: u64) -> PartitionBatch {
        let records = offsets
            .iter()
            .map(|o| {
                Record::new(
                    partition.clone(),
                    *o,
                    Some(format!("key-{o}").into_bytes()),
                    Some(envelope_payload(&EventEnvelope::new("product_created"))),
                )
            })
            .collect();
        PartitionBatch::new(partition.clone(), records, batch_id)
    }

    struct Fixture {
        handler: Arc<RecordingHandler>,
        committer: Arc<RecordingCommitter>,
        errors: mpsc::UnboundedReceiver<ConsumerError>,
        context: WorkerContext,
    }

    fn fixture(handler: RecordingHandler) -> Fixture {
        let handler = Arc::new(handler);
        let committer = Arc::new(RecordingCommitter::observing(handler.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        let context = WorkerContext {
            handler: handler.clone(),
            committer: committer.clone(),
            errors: tx,
            cancel: CancellationToken::new(),
        };
        Fixture {
            handler,
            committer,
            errors: rx,
            context,
        }
    }

    #[tokio::test]
    async fn test_commit_policy_parsing() {
        assert_eq!(
            "after_dispatch".parse::<CommitPolicy>().unwrap(),
            CommitPolicy::AfterDispatch
        );
        assert_eq!(
            "AFTER_COMPLETION".parse::<CommitPolicy>().unwrap(),
            CommitPolicy::AfterCompletion
        );
        assert!("sometimes".parse::<CommitPolicy>().is_err());
        assert_eq!(CommitPolicy::default().to_string(), "after_dispatch");
    }

    #[tokio::test]
    async fn test_worker_dispatches_in_order_and_commits_batches() {
        let f = fixture(RecordingHandler::default());
        let partition = Partition::new("T", 0);
        let worker = PartitionWorker::spawn(
            partition.clone(),
            &f.context,
            &PartitionWorkerConfig::default(),
            &Handle::current(),
        );

        worker.sender().send(batch(&partition, &[0, 1, 2], 1)).await.unwrap();
        worker.sender().send(batch(&partition, &[3, 4], 2)).await.unwrap();
        worker.shutdown().await;

        assert_eq!(f.handler.offsets_for(&partition), vec![0, 1, 2, 3, 4]);
        assert_eq!(f.committer.commits(), vec![vec![0, 1, 2], vec![3, 4]]);
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped_but_committed() {
        let f = fixture(RecordingHandler::default());
        let partition = Partition::new("T", 0);
        let worker = PartitionWorker::spawn(
            partition.clone(),
            &f.context,
            &PartitionWorkerConfig::default(),
            &Handle::current(),
        );

        let mut batch = batch(&partition, &[0, 1, 2], 1);
        batch.records[1].payload = Some(b"{not an envelope".to_vec());
        worker.sender().send(batch).await.unwrap();
        worker.shutdown().await;

        assert_eq!(f.handler.offsets_for(&partition), vec![0, 2]);
        assert_eq!(f.committer.commits(), vec![vec![0, 1, 2]]);
    }

    #[tokio::test]
    async fn test_handler_error_is_reported_and_consumption_continues() {
        let mut f = fixture(RecordingHandler::failing_on([1]));
        let partition = Partition::new("T", 0);
        let worker = PartitionWorker::spawn(
            partition.clone(),
            &f.context,
            &PartitionWorkerConfig::default(),
            &Handle::current(),
        );

        worker.sender().send(batch(&partition, &[0, 1, 2], 1)).await.unwrap();
        worker.sender().send(batch(&partition, &[3], 2)).await.unwrap();
        worker.shutdown().await;

        match f.errors.try_recv().unwrap() {
            ConsumerError::Handler {
                partition: p,
                offset,
                ..
            } => {
                assert_eq!(p, partition);
                assert_eq!(offset, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(f.errors.try_recv().is_err());
        assert_eq!(f.committer.commits(), vec![vec![0, 1, 2], vec![3]]);
        assert_eq!(f.handler.offsets_for(&partition), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_quit_waits_for_in_flight_handlers() {
        let f = fixture(RecordingHandler::with_delay(Duration::from_millis(200)));
        let partition = Partition::new("T", 0);
        let worker = PartitionWorker::spawn(
            partition.clone(),
            &f.context,
            &PartitionWorkerConfig::default(),
            &Handle::current(),
        );

        worker.sender().send(batch(&partition, &[0, 1], 1)).await.unwrap();
        f.handler.wait_started(2).await;
        assert_eq!(f.handler.completed(), 0);

        worker.shutdown().await;

        // done only fires after both handlers returned
        assert_eq!(f.handler.completed(), 2);
    }

    #[tokio::test]
    async fn test_quit_discards_queued_batches() {
        let f = fixture(RecordingHandler::with_delay(Duration::from_millis(200)));
        let partition = Partition::new("T", 0);
        let worker = PartitionWorker::spawn(
            partition.clone(),
            &f.context,
            &PartitionWorkerConfig::default(),
            &Handle::current(),
        );
        let mut state = worker.subscribe_state();

        worker.sender().send(batch(&partition, &[0], 1)).await.unwrap();
        f.handler.wait_started(1).await;
        // AfterDispatch: the first batch is committed while its handler runs
        f.committer.wait_commits(1).await;

        // the worker is idle again, queue two batches then quit
        worker.quit();
        // fails once the worker closed its queue
        worker.sender().send(batch(&partition, &[1], 2)).await.ok();
        worker.sender().send(batch(&partition, &[2], 3)).await.ok();

        let (_, done) = worker.into_done();
        done.await.unwrap();

        assert_eq!(*state.borrow_and_update(), WorkerState::Stopped);
        assert_eq!(f.handler.offsets_for(&partition), vec![0]);
        assert_eq!(f.committer.commits(), vec![vec![0]]);
    }

    #[tokio::test]
    async fn test_after_completion_commits_once_handlers_finished() {
        let f = fixture(RecordingHandler::with_delay(Duration::from_millis(100)));
        let partition = Partition::new("T", 0);
        let config = PartitionWorkerConfig {
            commit_policy: CommitPolicy::AfterCompletion,
            ..Default::default()
        };
        let worker =
            PartitionWorker::spawn(partition.clone(), &f.context, &config, &Handle::current());

        worker.sender().send(batch(&partition, &[0, 1, 2], 1)).await.unwrap();
        f.committer.wait_commits(1).await;

        // the commit was only issued once every handler completed
        assert_eq!(f.committer.completed_before_first_commit(), Some(3));
        assert_eq!(f.handler.completed(), 3);

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_after_dispatch_commits_before_handlers_finished() {
        let f = fixture(RecordingHandler::with_delay(Duration::from_millis(300)));
        let partition = Partition::new("T", 0);
        let worker = PartitionWorker::spawn(
            partition.clone(),
            &f.context,
            &PartitionWorkerConfig::default(),
            &Handle::current(),
        );

        worker.sender().send(batch(&partition, &[0, 1, 2], 1)).await.unwrap();
        f.committer.wait_commits(1).await;
        assert_eq!(f.committer.completed_before_first_commit(), Some(0));

        worker.shutdown().await;
        assert_eq!(f.handler.completed(), 3);
    }

    #[tokio::test]
    async fn test_runtime_cancellation_stops_worker() {
        let f = fixture(RecordingHandler::default());
        let partition = Partition::new("T", 0);
        let worker = PartitionWorker::spawn(
            partition.clone(),
            &f.context,
            &PartitionWorkerConfig::default(),
            &Handle::current(),
        );

        f.context.cancel.cancel();
        let (_, done) = worker.into_done();
        tokio::time::timeout(Duration::from_secs(5), done)
            .await
            .unwrap()
            .unwrap();
    }
}
