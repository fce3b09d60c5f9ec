use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use http::{HeaderName, HeaderValue};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Logs every request and its outcome, and echoes the request id back in
/// `x-request-id`, generating one when the client sent none.
pub async fn log_requests(request: Request, next: Next) -> Response {
    let started_at = Instant::now();
    let request_id = request
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        "incoming request"
    );

    let mut response = next.run(request).await;

    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = %response.status(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
