use std::time;

use reqwest::{header, Client};

/// Shared builder for the outbound HTTP clients (notifier, model backends). Clients are built
/// once at startup and cloned into each adapter.
pub fn build_http_client(
    user_agent: &str,
    request_timeout: time::Duration,
) -> reqwest::Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent(user_agent)
        .timeout(request_timeout)
        .build()
}
