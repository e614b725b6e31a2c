use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use tracing::{info, warn};

const LOG_TARGET: &str = "server::http";

/// Access log: one line per request, at `warn` for 5xx responses.
/// Query strings are left out since they carry player ids.
pub async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let upgrade = request.headers().contains_key(axum::http::header::UPGRADE);

    let start = Instant::now();
    let response = next.run(request).await;
    let elapsed_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    if response.status().is_server_error() {
        warn!(target = LOG_TARGET, %method, %path, status, elapsed_ms, "request failed");
    } else {
        info!(target = LOG_TARGET, %method, %path, status, elapsed_ms, upgrade, "request completed");
    }
    response
}
