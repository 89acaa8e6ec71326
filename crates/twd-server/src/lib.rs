// SPDX-License-Identifier: MIT OR Apache-2.0

//! Public HTTP surface of the Twinward agent.
//!
//! Routes: `POST /chat`, `POST /reset`, `GET /tasks`, `GET /tasks/{id}`,
//! `POST /tasks/{id}/approve|reject|execute`, `GET /health`, `GET /ready`,
//! `GET /metrics`. Readiness requires an initialized shadow and a connected
//! event bus; chat and execute refuse with 503 while draining.

#![deny(unsafe_code)]

pub mod auth;
pub mod drain;
pub mod metrics;
pub mod middleware;

use axum::extract::{Extension, Path as AxPath, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use tracing::error;
use twd_audit::AuditContext;
use twd_bus::EventBusClient;
use twd_config::Settings;
use twd_orchestrator::Orchestrator;
use twd_ratelimit::RateLimiter;
use twd_resilience::CircuitBreaker;
use twd_safety::SafetyKernel;
use twd_shadow::ShadowManager;

use crate::auth::authenticate;
use crate::drain::DrainState;
use crate::metrics::Metrics;
use crate::middleware::RequestId;

/// Shared state behind every handler.
pub struct AppState {
    /// Request state machine.
    pub orchestrator: Arc<Orchestrator>,
    /// Safety kernel, for the task endpoints.
    pub safety: Arc<SafetyKernel>,
    /// Shadow replica, for readiness and metrics.
    pub shadow: Arc<ShadowManager>,
    /// Event bus, for readiness.
    pub bus: Arc<EventBusClient>,
    /// Breaker around the twin transport, surfaced in readiness.
    pub twin_breaker: Arc<CircuitBreaker>,
    /// Per-client admission control.
    pub limiter: Arc<RateLimiter>,
    /// Immutable settings.
    pub settings: Arc<Settings>,
    /// Shutdown/drain coordination.
    pub drain: Arc<DrainState>,
    /// Process counters.
    pub metrics: Arc<Metrics>,
    /// Startup instant, for uptime reporting.
    pub started_at: Instant,
}

/// JSON error responder.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status.
    pub status: StatusCode,
    /// Error message.
    pub message: String,
}

impl ApiError {
    /// Build an error response.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

/// Build the router with all routes and middleware.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chat", post(cmd_chat))
        .route("/reset", post(cmd_reset))
        .route("/tasks", get(cmd_list_tasks))
        .route("/tasks/{task_id}", get(cmd_get_task))
        .route("/tasks/{task_id}/approve", post(cmd_approve_task))
        .route("/tasks/{task_id}/reject", post(cmd_reject_task))
        .route("/tasks/{task_id}/execute", post(cmd_execute_task))
        .route("/health", get(cmd_health))
        .route("/ready", get(cmd_ready))
        .route("/metrics", get(cmd_metrics))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            middleware::rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(axum::middleware::from_fn(middleware::request_logger_middleware))
        .with_state(state)
}

fn audit_context(request_id: &RequestId, subject: Option<&str>) -> AuditContext {
    AuditContext {
        request_id: Some(request_id.0.clone()),
        subject: subject.map(str::to_string),
    }
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    message: String,
}

async fn cmd_chat(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> Result<Json<Value>, ApiError> {
    if state.drain.is_shutting_down() {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Server is shutting down",
        ));
    }
    let _guard = state.drain.request_started();

    if body.message.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Missing 'message' field"));
    }
    let identity = authenticate(&headers, &state.settings)?;
    let ctx = audit_context(&request_id, identity.subject.as_deref());

    state.metrics.inc_chat();
    let reply = state
        .orchestrator
        .process_message(&body.message, &identity.roles, &ctx)
        .await
        .map_err(|err| {
            error!(error = %err, "chat processing failed");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        })?;
    state.metrics.record_tool_results(&reply.tool_results);

    serde_json::to_value(&reply)
        .map(Json)
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

async fn cmd_reset(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.orchestrator.reset_conversation().await;
    Json(json!({"status": "conversation reset"}))
}

async fn cmd_list_tasks(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
) -> Result<Json<Value>, ApiError> {
    let ctx = audit_context(&request_id, None);
    let tasks = state
        .safety
        .get_all_tasks(&ctx)
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(json!({"tasks": tasks})))
}

async fn cmd_get_task(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    AxPath(task_id): AxPath<String>,
) -> Result<Json<Value>, ApiError> {
    let ctx = audit_context(&request_id, None);
    let task = state
        .safety
        .get_task(&task_id, &ctx)
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "task not found"))?;
    serde_json::to_value(&task)
        .map(Json)
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

#[derive(Debug, Default, Deserialize)]
struct ApproveRequest {
    #[serde(default)]
    approver: Option<String>,
}

async fn cmd_approve_task(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    AxPath(task_id): AxPath<String>,
    headers: HeaderMap,
    Json(body): Json<ApproveRequest>,
) -> Result<Json<Value>, ApiError> {
    let identity = authenticate(&headers, &state.settings)?;
    let ctx = audit_context(&request_id, identity.subject.as_deref());
    if state
        .safety
        .get_task(&task_id, &ctx)
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .is_none()
    {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "task not found"));
    }
    let approver = body
        .approver
        .or(identity.subject)
        .unwrap_or_else(|| "unknown".to_string());
    let approved = state
        .safety
        .approve_task(&task_id, &approver, &ctx)
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(json!({"task_id": task_id, "approved": approved})))
}

#[derive(Debug, Default, Deserialize)]
struct RejectRequest {
    #[serde(default)]
    rejector: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

async fn cmd_reject_task(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    AxPath(task_id): AxPath<String>,
    headers: HeaderMap,
    Json(body): Json<RejectRequest>,
) -> Result<Json<Value>, ApiError> {
    let identity = authenticate(&headers, &state.settings)?;
    let ctx = audit_context(&request_id, identity.subject.as_deref());
    if state
        .safety
        .get_task(&task_id, &ctx)
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .is_none()
    {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "task not found"));
    }
    let rejector = body
        .rejector
        .or(identity.subject)
        .unwrap_or_else(|| "unknown".to_string());
    let rejected = state
        .safety
        .reject_task(
            &task_id,
            &rejector,
            body.reason.as_deref().unwrap_or(""),
            &ctx,
        )
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(json!({"task_id": task_id, "rejected": rejected})))
}

async fn cmd_execute_task(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    AxPath(task_id): AxPath<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    if state.drain.is_shutting_down() {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Server is shutting down",
        ));
    }
    let _guard = state.drain.request_started();

    let identity = authenticate(&headers, &state.settings)?;
    let ctx = audit_context(&request_id, identity.subject.as_deref());
    let reply = state
        .orchestrator
        .execute_approved_task(&task_id, &identity.roles, &ctx)
        .await;
    state.metrics.record_tool_results(&reply.tool_results);
    serde_json::to_value(&reply)
        .map(Json)
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

async fn cmd_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "uptime_secs": state.started_at.elapsed().as_secs_f64(),
        "shutting_down": state.drain.is_shutting_down(),
    }))
}

async fn cmd_ready(State(state): State<Arc<AppState>>) -> Response {
    let shadow_initialized = state.shadow.is_initialized();
    let bus_connected = state.bus.is_connected();
    let breaker = state.twin_breaker.stats();
    let all_ready =
        shadow_initialized && bus_connected && !state.drain.is_shutting_down();

    let body = json!({
        "status": if all_ready { "ready" } else { "not_ready" },
        "checks": {
            "shadow_initialized": shadow_initialized,
            "bus_connected": bus_connected,
            "twin_breaker": breaker.state,
            "shadow_freshness_seconds": finite_or_null(state.shadow.freshness_seconds().await),
        },
        "active_requests": state.drain.active_requests(),
    });
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

fn finite_or_null(value: f64) -> Value {
    if value.is_finite() {
        json!(value)
    } else {
        Value::Null
    }
}

async fn cmd_metrics(State(state): State<Arc<AppState>>) -> Response {
    let mut text = state.metrics.render();
    text.push_str(&format!(
        "twinward_bus_connected {}\n",
        u8::from(state.bus.is_connected())
    ));
    text.push_str(&format!(
        "twinward_shadow_event_count {}\n",
        state.shadow.event_count()
    ));
    let freshness = state.shadow.freshness_seconds().await;
    if freshness.is_finite() {
        text.push_str(&format!("twinward_shadow_freshness_seconds {freshness}\n"));
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    )
        .into_response()
}
