use envconfig::Envconfig;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use ingest_common::config::{build_dependencies, build_pipelines};
use ingest_common::prometheus::{serve, setup_metrics_router};
use ingest_worker::config::Config;
use ingest_worker::error::WorkerError;
use ingest_worker::expiry::ExpirySweeper;
use ingest_worker::worker::IngestWorker;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let deps = build_dependencies(&config.pipeline)
        .await
        .expect("failed to initialize pipeline dependencies");
    let store = deps.store.clone();
    let time_source = deps.time.clone();
    let pipelines =
        build_pipelines(&config.pipeline, deps).expect("failed to initialize pipelines");

    let sweeper = ExpirySweeper::new(store, time_source, config.expiry_interval.0);
    tokio::spawn(async move { sweeper.run().await });

    let router = setup_metrics_router();
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let queue = config
        .inbound_queue()
        .await
        .expect("failed to initialize queue");
    let Some(queue) = queue else {
        warn!("print sink mode has no inbound queue, only expiring records");
        std::future::pending::<()>().await;
        return Ok(());
    };

    let worker = IngestWorker::new(
        &config.worker_name,
        config.inbound_queue_name.as_str(),
        queue,
        pipelines,
        config.poll_interval.0,
        config.max_concurrent_jobs,
        config.retry_policy.policy(),
    );
    worker.run().await?;

    Ok(())
}
