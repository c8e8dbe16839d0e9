use axum::{extract::Request, http::header, middleware::Next, response::Response};
use std::time::Instant;
use tracing::info;

/// Request timing correlated with the gateway's `x-request-id`, so a slow
/// `/generate` intake or `/i/` proxy fetch can be tied back to the task a
/// client later polls about. Runs inside `request_id_middleware`, which
/// has already stamped the header.
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let range = req.headers().contains_key(header::RANGE);

    let response = next.run(req).await;

    let latency = start.elapsed();
    let status = response.status();
    let cache = response
        .headers()
        .get("x-edge-cache")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");

    info!(
        target: "metrics",
        request_id = %request_id,
        method = %method,
        path = %path,
        status = %status.as_u16(),
        latency_ms = %latency.as_millis(),
        edge_cache = %cache,
        range,
        "request completed"
    );

    response
}
