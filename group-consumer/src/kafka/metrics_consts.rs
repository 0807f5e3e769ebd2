// ==== Poll / dispatch loop metrics ====
/// Counter for poll iterations of the dispatch loop
pub const DISPATCH_POLLS: &str = "group_consumer_dispatch_polls_total";

/// Counter for records returned by the record source
pub const DISPATCH_RECORDS: &str = "group_consumer_dispatch_records_total";

/// Counter for batches dropped because no worker owned the partition
pub const DISPATCH_UNOWNED_BATCHES: &str = "group_consumer_dispatch_unowned_batches_total";

/// Counter for enqueues that had to wait on a full worker queue
pub const DISPATCH_BACKPRESSURE: &str = "group_consumer_dispatch_backpressure_total";

/// Counter for fetched records dropped because their partition was revoked
/// within the same poll
pub const SOURCE_DISCARDED_RECORDS: &str = "group_consumer_source_discarded_records_total";

/// Counter for transient errors returned by the kafka client during poll
pub const SOURCE_POLL_ERRORS: &str = "group_consumer_source_poll_errors_total";

// ==== Rebalance metrics ====
/// Counter for rebalance events, labelled by kind (assign / revoke / lost)
pub const REBALANCE_EVENTS: &str = "group_consumer_rebalance_events_total";

/// Gauge for the number of partition workers currently alive
pub const ASSIGNED_PARTITIONS: &str = "group_consumer_assigned_partitions";

/// Histogram for the time a revoke / lost callback spent draining workers
pub const REBALANCE_DRAIN_DURATION: &str = "group_consumer_rebalance_drain_duration_seconds";

/// Counter for workers aborted because their drain exceeded the timeout
pub const REBALANCE_DRAIN_ABANDONED: &str = "group_consumer_rebalance_drain_abandoned_total";

// ==== Partition worker metrics ====
/// Counter for records handed to the message handler
pub const WORKER_RECORDS_DISPATCHED: &str = "group_consumer_worker_records_dispatched_total";

/// Counter for records skipped because their payload could not be decoded
pub const WORKER_DECODE_ERRORS: &str = "group_consumer_worker_decode_errors_total";

/// Counter for handler invocations that returned an error
pub const WORKER_HANDLER_ERRORS: &str = "group_consumer_worker_handler_errors_total";

/// Histogram for handler invocation duration
pub const WORKER_HANDLER_DURATION: &str = "group_consumer_worker_handler_duration_seconds";

/// Counter for queued batches thrown away while a worker drained
pub const WORKER_DISCARDED_BATCHES: &str = "group_consumer_worker_discarded_batches_total";

// ==== Commit metrics ====
/// Counter for offset commits, labelled by outcome
pub const COMMITS: &str = "group_consumer_commits_total";

/// Gauge for the last committed next-offset per partition
pub const COMMITTED_OFFSET: &str = "group_consumer_committed_offset";

// ==== Producer metrics ====
/// Counter for events produced, labelled by outcome
pub const PRODUCED_EVENTS: &str = "group_consumer_produced_events_total";

// ==== Service metrics ====
/// Counter for errors drained from the shared error channel, labelled by kind
pub const CONSUMER_ERRORS: &str = "group_consumer_errors_total";
