//! Composition root of a consumer instance.
//!
//! A [`ConsumerService`] owns everything one subscription needs: the topic
//! bootstrap, the kafka record source, the assignment coordinator and its
//! workers, the dispatch loop and the error reporter. Nothing is global, so
//! several jobs can run in one process.

use std::sync::Arc;
use std::time::Duration;

use health::{HealthHandle, HealthRegistry};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{ConsumerError, ServiceError};
use crate::kafka::admin::{ensure_topic, KafkaTopicAdmin, TopicAdmin};
use crate::kafka::client::KafkaRecordSource;
use crate::kafka::coordinator::{AssignmentCoordinator, CoordinatorConfig, DrainOutcome};
use crate::kafka::dispatcher::{DispatchLoop, DispatchStats};
use crate::kafka::metrics_consts::CONSUMER_ERRORS;
use crate::kafka::partition_worker::WorkerContext;
use crate::kafka::source::{MessageHandler, OffsetCommitter, RecordSource};
use crate::kafka::types::Partition;

const ADMIN_TIMEOUT: Duration = Duration::from_secs(10);

/// One subscription: which group consumes, and what runs for every record.
#[derive(Clone)]
pub struct ConsumerJob {
    /// Used to tell jobs apart in logs and health components
    pub title: String,
    pub group: String,
    /// Overrides the configured fixed partition when set
    pub partition: Option<i32>,
    pub handler: Arc<dyn MessageHandler>,
}

impl ConsumerJob {
    pub fn new(title: &str, group: &str, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            title: title.to_owned(),
            group: group.to_owned(),
            partition: None,
            handler,
        }
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }
}

/// What a stopped job did
#[derive(Debug, Default)]
pub struct JobSummary {
    pub dispatch: DispatchStats,
    /// Workers still running at shutdown, and how they ended
    pub drained: Vec<(Partition, DrainOutcome)>,
    pub errors_reported: usize,
}

/// A job wired to a record source, ready to run.
pub struct JobRun {
    title: String,
    source: Arc<dyn RecordSource>,
    coordinator: Arc<AssignmentCoordinator>,
    errors: mpsc::UnboundedReceiver<ConsumerError>,
    max_records: usize,
    liveness: Option<HealthHandle>,
    cancel: CancellationToken,
}

impl JobRun {
    /// Build the coordinator of `job`. Its workers run on the current
    /// runtime and stop when `cancel` fires. The caller binds
    /// [`JobRun::coordinator`] to the source as its rebalance listener.
    pub fn new(
        job: &ConsumerJob,
        source: Arc<dyn RecordSource>,
        committer: Arc<dyn OffsetCommitter>,
        mut config: CoordinatorConfig,
        max_records: usize,
        cancel: &CancellationToken,
    ) -> Self {
        if job.partition.is_some() {
            config.fixed_partition = job.partition;
        }

        let (errors_tx, errors) = mpsc::unbounded_channel();
        let context = WorkerContext {
            handler: job.handler.clone(),
            committer,
            errors: errors_tx,
            cancel: cancel.clone(),
        };
        let coordinator = Arc::new(AssignmentCoordinator::new(
            &job.group,
            context,
            config,
            Handle::current(),
        ));

        Self {
            title: job.title.clone(),
            source,
            coordinator,
            errors,
            max_records,
            liveness: None,
            cancel: cancel.clone(),
        }
    }

    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn coordinator(&self) -> Arc<AssignmentCoordinator> {
        self.coordinator.clone()
    }

    /// Run the dispatch loop until cancelled or the source closes, then
    /// drain every worker still owned. Errors of the loop are returned after
    /// the workers are drained.
    pub async fn run(self) -> Result<JobSummary, ServiceError> {
        let reporter_done = CancellationToken::new();
        let reporter = tokio::spawn(report_errors(
            self.title.clone(),
            self.errors,
            reporter_done.clone(),
        ));

        let mut dispatch =
            DispatchLoop::new(self.source, self.coordinator.clone(), self.max_records);
        if let Some(liveness) = self.liveness {
            dispatch = dispatch.with_liveness(liveness);
        }
        let dispatched = dispatch.run(self.cancel.clone()).await;
        if let Err(e) = &dispatched {
            error!(job = %self.title, "Dispatch loop failed: {e:?}");
        }

        // blocks on the worker drains, so keep it off the async threads
        let coordinator = self.coordinator.clone();
        let drained = tokio::task::spawn_blocking(move || coordinator.shutdown_all()).await?;

        reporter_done.cancel();
        let errors_reported = reporter.await?;

        let dispatch = dispatched?;
        info!(
            job = %self.title,
            records = dispatch.records,
            workers_drained = drained.len(),
            errors_reported,
            "Consumer job stopped"
        );

        Ok(JobSummary {
            dispatch,
            drained,
            errors_reported,
        })
    }
}

/// Log every error sent by the workers until `done` fires and the channel
/// is empty. Returns the number of errors seen.
async fn report_errors(
    job: String,
    mut errors: mpsc::UnboundedReceiver<ConsumerError>,
    done: CancellationToken,
) -> usize {
    let mut reported = 0;
    loop {
        tokio::select! {
            biased;
            Some(e) = errors.recv() => {
                let kind = match &e {
                    ConsumerError::Handler { .. } => "handler",
                    ConsumerError::Commit { .. } => "commit",
                };
                error!(job = %job, partition = %e.partition(), kind, "Consumer error: {e:?}");
                metrics::counter!(CONSUMER_ERRORS, "kind" => kind).increment(1);
                reported += 1;
            }
            _ = done.cancelled() => break,
        }
    }
    reported
}

/// Runs consumer jobs against the configured kafka cluster.
pub struct ConsumerService {
    config: Config,
    liveness: HealthRegistry,
    admin: Option<Arc<dyn TopicAdmin>>,
}

impl ConsumerService {
    pub fn new(config: Config, liveness: HealthRegistry) -> Self {
        Self {
            config,
            liveness,
            admin: None,
        }
    }

    /// Bootstrap the topic through `admin` instead of an admin client built
    /// from the configuration
    pub fn with_topic_admin(mut self, admin: Arc<dyn TopicAdmin>) -> Self {
        self.admin = Some(admin);
        self
    }

    /// Make sure the topic exists, join the group and consume until `cancel`
    /// fires. Every owned partition is drained and the client has left the
    /// group when this returns.
    pub async fn run(
        &self,
        job: ConsumerJob,
        cancel: CancellationToken,
    ) -> Result<JobSummary, ServiceError> {
        let admin: Arc<dyn TopicAdmin> = match &self.admin {
            Some(admin) => admin.clone(),
            None => Arc::new(KafkaTopicAdmin::new(
                &self.config.admin_config(),
                ADMIN_TIMEOUT,
            )?),
        };
        ensure_topic(admin.as_ref(), &self.config.topic_spec()).await?;

        let source = Arc::new(KafkaRecordSource::new(
            &self.config.consumer_config(&job.group),
            self.config.poll_timeout.0,
        )?);

        let liveness = self.liveness.register(
            &format!("dispatch-loop-{}", job.title),
            time::Duration::seconds(30),
        );
        let run = JobRun::new(
            &job,
            source.clone(),
            Arc::new(source.committer()),
            self.config.coordinator_config(),
            self.config.poll_max_records,
            &cancel,
        )
        .with_liveness(liveness);

        if !source.bind(run.coordinator()) {
            return Err(ServiceError::Config(
                "record source is already bound to a coordinator".to_owned(),
            ));
        }
        source.subscribe(&self.config.kafka.kafka_consumer_topic)?;
        info!(
            job = %job.title,
            group = %job.group,
            topic = %self.config.kafka.kafka_consumer_topic,
            "Consumer job started"
        );

        let result = run.run().await;

        // leaving the group blocks on the broker
        tokio::task::spawn_blocking(move || {
            source.close();
            drop(source);
        })
        .await?;

        result
    }
}
