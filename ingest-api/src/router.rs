use std::future::ready;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use ingest_common::pipeline::Pipelines;
use ingest_common::prometheus::{setup_metrics_recorder, track_metrics};

use crate::handlers;

#[derive(Clone)]
pub struct State {
    pub pipelines: Pipelines,
}

async fn index() -> &'static str {
    "ingest-api"
}

async fn liveness() -> &'static str {
    "ok"
}

pub fn router(pipelines: Pipelines, metrics: bool) -> Router {
    let state = State { pipelines };

    let router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(liveness))
        .route("/events", post(handlers::events))
        .route("/user-events", post(handlers::user_events))
        .route("/analytics", post(handlers::analytics))
        .route("/ml/inference", post(handlers::ml_inference))
        .route("/batch", post(handlers::batch))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // The recorder is global: only the binary installs it, tests build routers without it.
    if metrics {
        let recorder_handle = setup_metrics_recorder();

        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
