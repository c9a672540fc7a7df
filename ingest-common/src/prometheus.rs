// prometheus exporter setup and metric helpers

use std::time::{Duration, Instant};

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::envelope::EventClass;

pub const INVOCATIONS_TOTAL: &str = "ingest_invocations_total";
pub const INVOCATION_FAILURES_TOTAL: &str = "ingest_invocation_failures_total";
pub const PROCESSING_DURATION_SECONDS: &str = "ingest_processing_duration_seconds";

pub fn report_invocation(class: EventClass, success: bool, elapsed: Duration) {
    let outcome = if success { "success" } else { "failure" };
    counter!(INVOCATIONS_TOTAL, "class" => class.as_str(), "outcome" => outcome).increment(1);
    histogram!(PROCESSING_DURATION_SECONDS, "class" => class.as_str())
        .record(elapsed.as_secs_f64());
}

pub fn report_failed_invocation(class: EventClass, kind: &'static str) {
    let tags = [("class", class.as_str()), ("error", kind)];
    counter!(INVOCATION_FAILURES_TOTAL, &tags).increment(1);
}

pub fn report_worker_message(queue: &str, outcome: &'static str) {
    let labels = [("queue", queue.to_owned()), ("outcome", outcome.to_owned())];
    counter!("ingest_worker_messages_total", &labels).increment(1);
}

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Router for binaries without an HTTP surface of their own: metrics and liveness only.
pub fn setup_metrics_router() -> Router {
    let recorder_handle = setup_metrics_recorder();

    Router::new()
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .route("/_liveness", get(|| std::future::ready("ok")))
        .layer(axum::middleware::from_fn(track_metrics))
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("_duration_seconds".to_string()),
            EXPONENTIAL_SECONDS,
        )
        .expect("failed to configure metric buckets")
        .install_recorder()
        .expect("failed to install metrics recorder")
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    // Run the rest of the request handling first, so we can measure it and get response
    // codes.
    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    counter!("http_requests_total", &labels).increment(1);
    histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
