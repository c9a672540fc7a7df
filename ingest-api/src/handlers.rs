use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use tracing::{debug, instrument};

use ingest_common::envelope::{EventClass, InvocationContext};
use ingest_common::response::ProcessingResponse;

use crate::router;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const PROCESSING_TIME_HEADER: &str = "x-processing-time-ms";

pub async fn events(state: State<router::State>, headers: HeaderMap, body: Bytes) -> Response {
    ingest(EventClass::Event, state, headers, body).await
}

pub async fn user_events(
    state: State<router::State>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    ingest(EventClass::UserEvent, state, headers, body).await
}

pub async fn analytics(state: State<router::State>, headers: HeaderMap, body: Bytes) -> Response {
    ingest(EventClass::Analytics, state, headers, body).await
}

pub async fn ml_inference(
    state: State<router::State>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    ingest(EventClass::MlInference, state, headers, body).await
}

pub async fn batch(state: State<router::State>, headers: HeaderMap, body: Bytes) -> Response {
    ingest(EventClass::Batch, state, headers, body).await
}

#[instrument(skip_all, fields(class = %class, body_size = body.len()))]
async fn ingest(
    class: EventClass,
    State(state): State<router::State>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = InvocationContext::new(
        header_value(&headers, REQUEST_ID_HEADER),
        header_value(&headers, CORRELATION_ID_HEADER),
    );

    let response = state.pipelines.run_bytes(class, &body, ctx).await;
    into_http(response)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// 200 on success, 400 on any handled failure. The body is the processing response.
fn into_http(response: ProcessingResponse) -> Response {
    let status = if response.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };

    let mut headers = HeaderMap::new();
    match HeaderValue::from_str(&response.correlation_id) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(CORRELATION_ID_HEADER), value);
        }
        Err(e) => debug!("correlation id is not a valid header value: {}", e),
    }
    headers.insert(
        HeaderName::from_static(PROCESSING_TIME_HEADER),
        HeaderValue::from(response.processing_time),
    );

    (status, headers, Json(response)).into_response()
}
