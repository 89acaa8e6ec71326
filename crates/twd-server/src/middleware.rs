// SPDX-License-Identifier: MIT OR Apache-2.0

//! Middleware stack: request ids, request logging, per-client rate limiting.

use crate::AppState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use twd_ratelimit::client_key;
use uuid::Uuid;

/// Per-request correlation id, available as an extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

/// Generate a [`RequestId`] per request and echo it as `X-Request-Id`.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4().to_string());
    req.extensions_mut().insert(id.clone());
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id.0) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Log method, path, status and duration for each request.
pub async fn request_logger_middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();

    let response = next.run(req).await;

    info!(
        http.method = %method,
        http.path = %path,
        http.status = response.status().as_u16(),
        http.duration_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );
    response
}

/// Token-bucket admission per client id, with configured path exclusions.
///
/// Clients are keyed by `X-API-Key` when present, falling back to the remote
/// address. Denials answer 429 with a `Retry-After` header.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if state
        .settings
        .server
        .rate_limit_exclude_paths
        .iter()
        .any(|excluded| excluded == path)
    {
        return next.run(req).await;
    }
    state.metrics.inc_request();

    let api_key = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |info| info.0.ip().to_string());
    let client_id = client_key(api_key, &remote);

    let decision = state.limiter.check(&client_id);
    if !decision.allowed {
        state.metrics.inc_rate_limited();
        let retry_after = decision.retry_after.as_secs().max(1) + 1;
        warn!(client_id = %client_id, path = %path, retry_after, "rate limit exceeded");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "Rate limit exceeded",
                "retry_after": retry_after,
            })),
        )
            .into_response();
        if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
            response.headers_mut().insert("retry-after", value);
        }
        return response;
    }

    next.run(req).await
}
