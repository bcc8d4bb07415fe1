//! Request logging middleware.

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn};

/// Log method, path, status and latency of every request except `/health`
/// and `/metrics` scrapes.
pub async fn request_logging_simple(request: Request<Body>, next: Next) -> Response {
    let path = request.uri().path().to_string();
    if path == "/health" || path == "/metrics" {
        return next.run(request).await;
    }
    let method = request.method().clone();

    let start = Instant::now();
    let response = next.run(request).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    if response.status().is_server_error() {
        warn!(method = %method, path = %path, status, latency_ms, "Request failed");
    } else {
        info!(method = %method, path = %path, status, latency_ms, "Request completed");
    }

    response
}
