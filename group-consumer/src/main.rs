use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use envconfig::Envconfig;
use futures::future::ready;
use health::HealthRegistry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use group_consumer::config::Config;
use group_consumer::handlers::LogEventHandler;
use group_consumer::metrics::{serve, setup_metrics_router};
use group_consumer::service::{ConsumerJob, ConsumerService};

pub async fn index() -> &'static str {
    "group consumer"
}

fn start_server(config: &Config, liveness: HealthRegistry) -> Result<JoinHandle<()>> {
    let router: Router = setup_metrics_router()
        .context("Failed to install the prometheus recorder")?
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));

    let bind = config.bind();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to start serving metrics: {e}");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env().context("Failed to load configuration from environment")?;
    config.validate().context("Invalid configuration")?;
    info!(
        topic = %config.kafka.kafka_consumer_topic,
        group = %config.kafka.kafka_consumer_group,
        commit_policy = %config.commit_policy,
        "Starting group consumer"
    );

    let liveness = HealthRegistry::new("liveness");
    let server_handle = start_server(&config, liveness.clone())?;
    info!("Started metrics server on {}", config.bind());

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received, draining partitions");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for the shutdown signal: {e}"),
        }
    });

    let job = ConsumerJob::new(
        &format!("{}-events", config.kafka.kafka_consumer_topic),
        &config.kafka.kafka_consumer_group,
        Arc::new(LogEventHandler),
    );
    let service = ConsumerService::new(config, liveness);

    // returns once every owned partition is drained
    let summary = service
        .run(job, cancel)
        .await
        .context("Consumer job failed")?;
    info!(
        records = summary.dispatch.records,
        errors = summary.errors_reported,
        "Group consumer stopped"
    );

    server_handle.abort();

    Ok(())
}
