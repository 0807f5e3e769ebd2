//! Assignment Coordinator - owns the partition -> worker map
//!
//! Reacts to the two group membership events. Assignment creates workers
//! for partitions not yet owned; revocation and loss remove workers, signal
//! them to quit and block the calling (polling) thread until every removed
//! worker has drained. That blocking wait is what keeps a partition from
//! being consumed by two workers across a rebalance.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::kafka::metrics_consts::{
    ASSIGNED_PARTITIONS, REBALANCE_DRAIN_ABANDONED, REBALANCE_DRAIN_DURATION, REBALANCE_EVENTS,
};
use crate::kafka::partition_worker::{PartitionWorker, PartitionWorkerConfig, WorkerContext};
use crate::kafka::record::PartitionBatch;
use crate::kafka::source::RebalanceListener;
use crate::kafka::types::{Partition, TopicPartitions};

#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    /// Only this partition index is ever instantiated, whatever the group
    /// coordinator assigns
    pub fixed_partition: Option<i32>,
    /// Upper bound on a revocation drain. None waits as long as it takes.
    pub drain_timeout: Option<Duration>,
    pub worker: PartitionWorkerConfig,
}

/// How a removed worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    Panicked,
    /// The drain exceeded the timeout and the worker task was aborted
    Abandoned,
}

pub struct AssignmentCoordinator {
    group: String,
    workers: DashMap<Partition, PartitionWorker>,
    context: WorkerContext,
    config: CoordinatorConfig,
    runtime: Handle,
}

impl AssignmentCoordinator {
    pub fn new(
        group: &str,
        context: WorkerContext,
        config: CoordinatorConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            group: group.to_owned(),
            workers: DashMap::new(),
            context,
            config,
            runtime,
        }
    }

    /// Start a worker for every newly assigned partition. Partitions already
    /// owned keep their worker, so repeated assignments are no-ops.
    pub fn on_assigned(&self, assigned: &TopicPartitions) {
        metrics::counter!(REBALANCE_EVENTS, "kind" => "assign").increment(1);

        for partition in assigned.partitions() {
            if let Some(fixed) = self.config.fixed_partition {
                if partition.partition_number() != fixed {
                    debug!(
                        group = %self.group,
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        fixed_partition = fixed,
                        "Ignoring partition outside the fixed partition filter"
                    );
                    continue;
                }
            }

            // entry() holds the shard lock, so the check and the insert are atomic
            self.workers.entry(partition.clone()).or_insert_with(|| {
                info!(
                    group = %self.group,
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    "Creating partition worker"
                );
                PartitionWorker::spawn(
                    partition.clone(),
                    &self.context,
                    &self.config.worker,
                    &self.runtime,
                )
            });
        }

        metrics::gauge!(ASSIGNED_PARTITIONS).set(self.workers.len() as f64);
    }

    /// Remove the workers of `removed`, signal them to quit and block until
    /// all of them stopped. Every worker is removed and signalled before the
    /// first wait, and the waits run concurrently.
    ///
    /// Blocks the calling thread: never call it from inside an async task.
    pub fn on_revoked_or_lost(
        &self,
        removed: &TopicPartitions,
        lost: bool,
    ) -> Vec<(Partition, DrainOutcome)> {
        let kind = if lost { "lost" } else { "revoke" };
        metrics::counter!(REBALANCE_EVENTS, "kind" => kind).increment(1);

        let workers: Vec<PartitionWorker> = removed
            .partitions()
            .filter_map(|p| self.workers.remove(&p).map(|(_, w)| w))
            .collect();
        metrics::gauge!(ASSIGNED_PARTITIONS).set(self.workers.len() as f64);

        if workers.is_empty() {
            return Vec::new();
        }

        if lost {
            // the group already moved on: commits of the drain will be rejected
            warn!(
                group = %self.group,
                partitions = workers.len(),
                "Partitions lost, draining workers"
            );
        } else {
            info!(
                group = %self.group,
                partitions = workers.len(),
                "Partitions revoked, draining workers"
            );
        }

        for worker in &workers {
            debug!(
                group = %self.group,
                partition = %worker.partition(),
                state = ?worker.state(),
                "Signalling partition worker to quit"
            );
            worker.quit();
        }

        let start = Instant::now();
        let drain_timeout = self.config.drain_timeout;
        let outcomes = self.runtime.block_on(join_all(
            workers
                .into_iter()
                .map(|worker| drain_worker(worker, drain_timeout)),
        ));

        metrics::histogram!(REBALANCE_DRAIN_DURATION, "kind" => kind)
            .record(start.elapsed().as_secs_f64());
        info!(
            group = %self.group,
            duration_ms = start.elapsed().as_millis() as u64,
            "Drained {} partition workers",
            outcomes.len()
        );

        outcomes
    }

    /// Revoke every owned partition. Used at shutdown so that no partition
    /// keeps committing after its worker stopped. Blocks like
    /// [`AssignmentCoordinator::on_revoked_or_lost`].
    pub fn shutdown_all(&self) -> Vec<(Partition, DrainOutcome)> {
        let owned: TopicPartitions = self.owned_partitions().into_iter().collect();
        info!(
            group = %self.group,
            partitions = owned.len(),
            "Shutting down all partition workers"
        );
        self.on_revoked_or_lost(&owned, false)
    }

    /// Sender of the worker owning `partition`, cloned so no map guard is
    /// held while the caller waits on a full queue
    pub fn worker_sender(&self, partition: &Partition) -> Option<mpsc::Sender<PartitionBatch>> {
        self.workers.get(partition).map(|w| w.sender())
    }

    /// Owned partitions in (topic, index) order
    pub fn owned_partitions(&self) -> Vec<Partition> {
        let mut owned: Vec<Partition> = self.workers.iter().map(|e| e.key().clone()).collect();
        owned.sort();
        owned
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn has_partition(&self, partition: &Partition) -> bool {
        self.workers.contains_key(partition)
    }
}

async fn drain_worker(
    worker: PartitionWorker,
    drain_timeout: Option<Duration>,
) -> (Partition, DrainOutcome) {
    let (partition, mut done) = worker.into_done();

    let result = match drain_timeout {
        None => done.await,
        Some(limit) => match tokio::time::timeout(limit, &mut done).await {
            Ok(result) => result,
            Err(_) => {
                done.abort();
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    timeout_ms = limit.as_millis() as u64,
                    "Partition worker did not drain in time, abandoning it"
                );
                metrics::counter!(REBALANCE_DRAIN_ABANDONED).increment(1);
                return (partition, DrainOutcome::Abandoned);
            }
        },
    };

    match result {
        Ok(()) => (partition, DrainOutcome::Drained),
        Err(e) => {
            error!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Partition worker panicked: {e}"
            );
            (partition, DrainOutcome::Panicked)
        }
    }
}

impl RebalanceListener for AssignmentCoordinator {
    fn on_assigned(&self, assigned: &TopicPartitions) {
        AssignmentCoordinator::on_assigned(self, assigned)
    }

    fn on_revoked(&self, revoked: &TopicPartitions) {
        self.on_revoked_or_lost(revoked, false);
    }

    fn on_lost(&self, lost: &TopicPartitions) {
        self.on_revoked_or_lost(lost, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use crate::kafka::test_utils::{test_records, RecordingCommitter, RecordingHandler};

    struct Fixture {
        handler: Arc<RecordingHandler>,
        committer: Arc<RecordingCommitter>,
        coordinator: Arc<AssignmentCoordinator>,
    }

    fn fixture(handler: RecordingHandler, config: CoordinatorConfig) -> Fixture {
        let handler = Arc::new(handler);
        let committer = Arc::new(RecordingCommitter::observing(handler.clone()));
        let (errors, _) = mpsc::unbounded_channel();
        let context = WorkerContext {
            handler: handler.clone(),
            committer: committer.clone(),
            errors,
            cancel: CancellationToken::new(),
        };
        let coordinator = Arc::new(AssignmentCoordinator::new(
            "test-group",
            context,
            config,
            Handle::current(),
        ));
        Fixture {
            handler,
            committer,
            coordinator,
        }
    }

    /// Runs a blocking coordinator call off the async runtime threads
    async fn blocking<T: Send + 'static>(
        coordinator: &Arc<AssignmentCoordinator>,
        f: impl FnOnce(&AssignmentCoordinator) -> T + Send + 'static,
    ) -> T {
        let coordinator = coordinator.clone();
        tokio::task::spawn_blocking(move || f(&coordinator))
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_assign_is_idempotent() {
        let f = fixture(RecordingHandler::default(), CoordinatorConfig::default());

        f.coordinator.on_assigned(&TopicPartitions::single("T", [0, 1]));
        let first = f.coordinator.worker_sender(&Partition::new("T", 0)).unwrap();

        f.coordinator.on_assigned(&TopicPartitions::single("T", [0, 1]));
        assert_eq!(f.coordinator.worker_count(), 2);

        // the first worker is still the owner
        let second = f.coordinator.worker_sender(&Partition::new("T", 0)).unwrap();
        assert!(first.same_channel(&second));

        blocking(&f.coordinator, |c| c.shutdown_all()).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fixed_partition_filter() {
        let config = CoordinatorConfig {
            fixed_partition: Some(1),
            ..Default::default()
        };
        let f = fixture(RecordingHandler::default(), config);

        f.coordinator.on_assigned(&TopicPartitions::single("T", [0, 1, 2]));

        assert_eq!(f.coordinator.owned_partitions(), vec![Partition::new("T", 1)]);
        blocking(&f.coordinator, |c| c.shutdown_all()).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_revoke_blocks_until_in_flight_handlers_finish() {
        let f = fixture(
            RecordingHandler::with_delay(Duration::from_millis(300)),
            CoordinatorConfig::default(),
        );
        let partition = Partition::new("T", 0);
        f.coordinator.on_assigned(&TopicPartitions::single("T", [0, 1]));

        let sender = f.coordinator.worker_sender(&partition).unwrap();
        let records = test_records(&partition, [0, 1]);
        sender
            .send(PartitionBatch::new(partition.clone(), records, 1))
            .await
            .unwrap();
        f.handler.wait_started(2).await;
        assert_eq!(f.handler.completed(), 0);

        let outcomes = blocking(&f.coordinator, |c| {
            c.on_revoked_or_lost(&TopicPartitions::single("T", [0]), false)
        })
        .await;

        // done fired only after both dispatches returned
        assert_eq!(outcomes, vec![(partition.clone(), DrainOutcome::Drained)]);
        assert_eq!(f.handler.completed(), 2);
        assert!(!f.coordinator.has_partition(&partition));
        assert!(f.coordinator.worker_sender(&partition).is_none());
        assert!(f.coordinator.has_partition(&Partition::new("T", 1)));
        assert_eq!(f.committer.commits_for(&partition), vec![vec![0, 1]]);

        blocking(&f.coordinator, |c| c.shutdown_all()).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_drain_is_unbounded_by_default() {
        assert_eq!(CoordinatorConfig::default().drain_timeout, None);

        let f = fixture(RecordingHandler::gated(), CoordinatorConfig::default());
        let partition = Partition::new("T", 0);
        f.coordinator.on_assigned(&TopicPartitions::single("T", [0]));

        let sender = f.coordinator.worker_sender(&partition).unwrap();
        sender
            .send(PartitionBatch::new(
                partition.clone(),
                test_records(&partition, [0]),
                1,
            ))
            .await
            .unwrap();
        f.handler.wait_started(1).await;

        let coordinator = f.coordinator.clone();
        let revoke = tokio::task::spawn_blocking(move || {
            coordinator.on_revoked_or_lost(&TopicPartitions::single("T", [0]), false)
        });

        // a stuck handler keeps the revocation waiting
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!revoke.is_finished());

        f.handler.release();
        let outcomes = revoke.await.unwrap();
        assert_eq!(outcomes, vec![(partition, DrainOutcome::Drained)]);
        assert_eq!(f.handler.completed(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bounded_drain_abandons_stuck_worker() {
        let config = CoordinatorConfig {
            drain_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let f = fixture(RecordingHandler::gated(), config);
        let partition = Partition::new("T", 0);
        f.coordinator.on_assigned(&TopicPartitions::single("T", [0, 1]));

        let sender = f.coordinator.worker_sender(&partition).unwrap();
        sender
            .send(PartitionBatch::new(
                partition.clone(),
                test_records(&partition, [0]),
                1,
            ))
            .await
            .unwrap();
        f.handler.wait_started(1).await;

        let start = Instant::now();
        let outcomes = blocking(&f.coordinator, |c| {
            c.on_revoked_or_lost(&TopicPartitions::single("T", [0, 1]), false)
        })
        .await;

        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(outcomes.contains(&(partition, DrainOutcome::Abandoned)));
        assert!(outcomes.contains(&(Partition::new("T", 1), DrainOutcome::Drained)));
        assert_eq!(f.coordinator.worker_count(), 0);
        f.handler.release();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reassignment_after_revoke_creates_fresh_worker() {
        let f = fixture(
            RecordingHandler::with_delay(Duration::from_millis(100)),
            CoordinatorConfig::default(),
        );
        let partition = Partition::new("T", 0);
        f.coordinator.on_assigned(&TopicPartitions::single("T", [0]));
        let old = f.coordinator.worker_sender(&partition).unwrap();

        blocking(&f.coordinator, |c| {
            c.on_revoked_or_lost(&TopicPartitions::single("T", [0]), false)
        })
        .await;
        // the old worker is gone: its queue is closed
        assert!(old.is_closed());

        f.coordinator.on_assigned(&TopicPartitions::single("T", [0]));
        let new = f.coordinator.worker_sender(&partition).unwrap();
        assert!(!new.same_channel(&old));
        assert_eq!(f.coordinator.worker_count(), 1);

        blocking(&f.coordinator, |c| c.shutdown_all()).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_revoke_of_unowned_partition_is_a_no_op() {
        let f = fixture(RecordingHandler::default(), CoordinatorConfig::default());
        f.coordinator.on_assigned(&TopicPartitions::single("T", [0]));

        let outcomes = blocking(&f.coordinator, |c| {
            c.on_revoked_or_lost(&TopicPartitions::single("T", [5]), true)
        })
        .await;

        assert!(outcomes.is_empty());
        assert_eq!(f.coordinator.worker_count(), 1);
        blocking(&f.coordinator, |c| c.shutdown_all()).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_all_drains_every_worker() {
        let f = fixture(
            RecordingHandler::with_delay(Duration::from_millis(50)),
            CoordinatorConfig::default(),
        );
        f.coordinator.on_assigned(&TopicPartitions::single("T", [0, 1, 2]));

        for n in 0..3 {
            let partition = Partition::new("T", n);
            let records = test_records(&partition, [10]);
            f.coordinator
                .worker_sender(&partition)
                .unwrap()
                .send(PartitionBatch::new(partition, records, n as u64 + 1))
                .await
                .unwrap();
        }
        f.handler.wait_started(3).await;

        let outcomes = blocking(&f.coordinator, |c| c.shutdown_all()).await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|(_, o)| *o == DrainOutcome::Drained));
        assert_eq!(f.handler.completed(), 3);
        assert_eq!(f.coordinator.worker_count(), 0);
    }
}
