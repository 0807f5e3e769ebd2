//! Prometheus exposition of the consumer metrics.

use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::kafka::metrics_consts::{
    ASSIGNED_PARTITIONS, COMMITS, COMMITTED_OFFSET, CONSUMER_ERRORS, DISPATCH_BACKPRESSURE,
    DISPATCH_POLLS, DISPATCH_RECORDS, DISPATCH_UNOWNED_BATCHES, PRODUCED_EVENTS,
    REBALANCE_DRAIN_ABANDONED, REBALANCE_DRAIN_DURATION, REBALANCE_EVENTS,
    SOURCE_DISCARDED_RECORDS, SOURCE_POLL_ERRORS, WORKER_DECODE_ERRORS,
    WORKER_DISCARDED_BATCHES, WORKER_HANDLER_DURATION, WORKER_HANDLER_ERRORS,
    WORKER_RECORDS_DISPATCHED,
};

// handler invocations take milliseconds, revocation drains can take minutes
const DURATION_BUCKETS_SECONDS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
];

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Install the global recorder and build a Router serving it on `/metrics`.
/// The caller adds its health routes.
pub fn setup_metrics_router() -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;
    describe_consumer_metrics();

    Ok(Router::new().route(
        "/metrics",
        get(move || std::future::ready(recorder_handle.render())),
    ))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    metrics_builder()?.install_recorder()
}

fn metrics_builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets(DURATION_BUCKETS_SECONDS)
}

/// Register help text and units for everything the consumer records.
pub fn describe_consumer_metrics() {
    describe_counter!(DISPATCH_POLLS, "Poll iterations of the dispatch loop");
    describe_counter!(DISPATCH_RECORDS, "Records returned by the record source");
    describe_counter!(
        DISPATCH_UNOWNED_BATCHES,
        "Batches dropped because no worker owned their partition"
    );
    describe_counter!(
        DISPATCH_BACKPRESSURE,
        "Batches that waited on a full partition worker queue"
    );
    describe_counter!(
        SOURCE_DISCARDED_RECORDS,
        "Fetched records dropped because their partition was revoked in the same poll"
    );
    describe_counter!(SOURCE_POLL_ERRORS, "Errors returned by the kafka client on poll");

    describe_counter!(REBALANCE_EVENTS, "Assign, revoke and lost events handled");
    describe_gauge!(ASSIGNED_PARTITIONS, "Partition workers currently running");
    describe_histogram!(
        REBALANCE_DRAIN_DURATION,
        Unit::Seconds,
        "Time a revoke or lost event spent draining partition workers"
    );
    describe_counter!(
        REBALANCE_DRAIN_ABANDONED,
        "Partition workers aborted after exceeding the drain timeout"
    );

    describe_counter!(WORKER_RECORDS_DISPATCHED, "Records handed to the message handler");
    describe_counter!(WORKER_DECODE_ERRORS, "Records skipped because they could not be decoded");
    describe_counter!(WORKER_HANDLER_ERRORS, "Handler invocations that returned an error");
    describe_histogram!(
        WORKER_HANDLER_DURATION,
        Unit::Seconds,
        "Duration of one handler invocation"
    );
    describe_counter!(
        WORKER_DISCARDED_BATCHES,
        "Queued batches thrown away when a worker was told to quit"
    );

    describe_counter!(COMMITS, "Offset commits by outcome");
    describe_gauge!(COMMITTED_OFFSET, "Last committed position per partition");
    describe_counter!(PRODUCED_EVENTS, "Events produced by outcome");
    describe_counter!(CONSUMER_ERRORS, "Handler and commit errors reported by the workers");
}
