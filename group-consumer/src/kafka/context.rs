use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::{ClientContext, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::kafka::source::RebalanceListener;
use crate::kafka::types::TopicPartitions;

/// rdkafka context of the group consumer.
///
/// librdkafka runs the rebalance callbacks from inside `poll()`, on the
/// polling thread. The listener is called synchronously there, so when a
/// revoke callback returns its partitions are already drained and the next
/// poll cannot hand out records of a partition still being drained.
///
/// The listener is bound after the client is created, since the coordinator
/// needs a committer backed by this same client.
///
/// Every rebalance handed to the listener bumps the rebalance epoch, and
/// revoked or lost partitions are kept until the poller takes them. The
/// poller uses both to throw away records it fetched before the rebalance.
#[derive(Default)]
pub struct GroupConsumerContext {
    listener: OnceLock<Arc<dyn RebalanceListener>>,
    rebalance_epoch: AtomicU64,
    removed: Mutex<TopicPartitions>,
}

impl GroupConsumerContext {
    /// Returns false if a listener was already bound
    pub fn bind(&self, listener: Arc<dyn RebalanceListener>) -> bool {
        self.listener.set(listener).is_ok()
    }

    pub fn is_bound(&self) -> bool {
        self.listener.get().is_some()
    }

    pub fn rebalance_epoch(&self) -> u64 {
        self.rebalance_epoch.load(Ordering::SeqCst)
    }

    /// Partitions revoked or lost since the last call
    pub fn take_removed(&self) -> TopicPartitions {
        let mut removed = self.removed.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *removed)
    }

    fn record_removed(&self, partitions: &TopicPartitions) {
        let mut removed = self.removed.lock().unwrap_or_else(PoisonError::into_inner);
        for partition in partitions.partitions() {
            removed.insert(partition.topic(), partition.partition_number());
        }
    }

    fn listener(&self) -> Option<&Arc<dyn RebalanceListener>> {
        let listener = self.listener.get();
        if listener.is_none() {
            error!("Rebalance event received before a listener was bound");
        }
        listener
    }
}

impl ClientContext for GroupConsumerContext {
    fn error(&self, error: KafkaError, reason: &str) {
        warn!("librdkafka error: {error}: {reason}");
    }
}

impl ConsumerContext for GroupConsumerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                let revoked = TopicPartitions::from(*partitions);
                // the cooperative protocol sends these when nothing moves
                if revoked.is_empty() {
                    debug!("Skipping empty revoke rebalance");
                    return;
                }
                let Some(listener) = self.listener() else {
                    return;
                };

                self.record_removed(&revoked);
                if base_consumer.assignment_lost() {
                    warn!("Assignment lost for {} partitions", revoked.len());
                    listener.on_lost(&revoked);
                } else {
                    info!("Revoking {} partitions", revoked.len());
                    listener.on_revoked(&revoked);
                }
                self.rebalance_epoch.fetch_add(1, Ordering::SeqCst);
            }
            Rebalance::Assign(partitions) => {
                debug!("Pre-rebalance assign event for {} partitions", partitions.count());
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {e}");
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            let assigned = TopicPartitions::from(*partitions);
            if assigned.is_empty() {
                debug!("Skipping empty assign rebalance");
                return;
            }
            let Some(listener) = self.listener() else {
                return;
            };

            info!("Assigned {} partitions", assigned.len());
            listener.on_assigned(&assigned);
            self.rebalance_epoch.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!("Offsets committed for {} partitions", offsets.count()),
            Err(e) => warn!("Offset commit failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl RebalanceListener for Events {
        fn on_assigned(&self, assigned: &TopicPartitions) {
            self.0.lock().unwrap().push(format!("assign {}", assigned.len()));
        }

        fn on_revoked(&self, revoked: &TopicPartitions) {
            self.0.lock().unwrap().push(format!("revoke {}", revoked.len()));
        }

        fn on_lost(&self, lost: &TopicPartitions) {
            self.0.lock().unwrap().push(format!("lost {}", lost.len()));
        }
    }

    #[test]
    fn test_rebalance_events_reach_listener() {
        let consumer: BaseConsumer<GroupConsumerContext> = rdkafka::ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .set("group.id", "test-group")
            .create_with_context(GroupConsumerContext::default())
            .expect("Consumer creation failed");
        let events = Arc::new(Events::default());
        consumer.context().bind(events.clone());

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition("T", 0);
        tpl.add_partition("T", 1);
        let empty = TopicPartitionList::new();

        let context = consumer.context();
        context.post_rebalance(&consumer, &Rebalance::Assign(&tpl));
        context.post_rebalance(&consumer, &Rebalance::Assign(&empty));
        context.pre_rebalance(&consumer, &Rebalance::Assign(&tpl));
        context.pre_rebalance(&consumer, &Rebalance::Revoke(&tpl));
        context.pre_rebalance(&consumer, &Rebalance::Revoke(&empty));

        assert_eq!(
            *events.0.lock().unwrap(),
            vec!["assign 2".to_string(), "revoke 2".to_string()]
        );

        // empty events and pre-assign do not count
        assert_eq!(context.rebalance_epoch(), 2);
        assert_eq!(context.take_removed(), TopicPartitions::single("T", [0, 1]));
        assert!(context.take_removed().is_empty());
    }

    #[test]
    fn test_bind_only_once() {
        let context = GroupConsumerContext::default();
        assert!(!context.is_bound());

        assert!(context.bind(Arc::new(Events::default())));
        assert!(!context.bind(Arc::new(Events::default())));
        assert!(context.is_bound());
    }
}
