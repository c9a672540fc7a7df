use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use ingest_api::config::Config;
use ingest_api::router;
use ingest_common::config::{build_dependencies, build_pipelines};

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("listening on {:?}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown())
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let deps = build_dependencies(&config.pipeline)
        .await
        .expect("failed to initialize pipeline dependencies");
    let pipelines =
        build_pipelines(&config.pipeline, deps).expect("failed to initialize pipelines");

    let app = router::router(pipelines, config.export_prometheus);

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start ingest-api http server, {}", e),
    }
}
