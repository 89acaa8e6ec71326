// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP surface tests: auth, admission, drain, task endpoints, probes.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::util::ServiceExt;
use twd_audit::AuditLog;
use twd_bus::{BusConfig, EventBusClient};
use twd_capability::{PriorityIndex, tool_specs};
use twd_config::{AuthMode, Settings};
use twd_llm::RulesPlanner;
use twd_orchestrator::{Orchestrator, OrchestratorConfig};
use twd_policy::{generate_keypair, sign_policy};
use twd_ratelimit::RateLimiter;
use twd_resilience::CircuitBreaker;
use twd_safety::{KernelConfig, SafetyKernel};
use twd_server::drain::DrainState;
use twd_server::metrics::Metrics;
use twd_server::{AppState, build_app};
use twd_shadow::{ShadowConfig, ShadowManager};
use twd_twin::{TwinClient, TwinConfig};
use twd_types::b64url_encode;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const AAS_ID: &str = "urn:api:aas:line";
const POLICY_SM: &str = "urn:api:submodel:policy";
const PLANT_SM: &str = "urn:api:submodel:plant";
const TASKS_SM: &str = "urn:api:submodel:tasks";

struct Api {
    server: MockServer,
    app: Router,
    state: Arc<AppState>,
    _dir: tempfile::TempDir,
}

async fn mount_twin(server: &MockServer) {
    let (private_pem, public_pem) = generate_keypair().unwrap();
    let policy_json = json!({
        "require_simulation_for_risk": "HIGH",
        "require_approval_for_risk": "CRITICAL",
        "role_bindings": {
            "operator": {"allow": ["GetStatus", "EmergencyStop"]}
        },
        "interlocks": [],
        "task_submodel_id": TASKS_SM,
        "tasks_property_path": "TasksJson"
    })
    .to_string();
    let signature = sign_policy(&policy_json, &private_pem).unwrap();

    Mock::given(method("GET"))
        .and(path(format!("/shells/{}", b64url_encode(AAS_ID))))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": AAS_ID})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/shells/{}/submodel-refs", b64url_encode(AAS_ID))))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": [
                {"keys": [{"type": "Submodel", "value": POLICY_SM}]},
                {"keys": [{"type": "Submodel", "value": PLANT_SM}]}
            ]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/submodels/{}", b64url_encode(POLICY_SM))))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": POLICY_SM,
            "submodelElements": [
                {"modelType": "Property", "idShort": "PolicyJson", "value": policy_json},
                {"modelType": "Property", "idShort": "PolicyPublicKeyPem", "value": public_pem},
                {"modelType": "Property", "idShort": "PolicySignature", "value": signature}
            ]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/submodels/{}", b64url_encode(PLANT_SM))))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": PLANT_SM,
            "submodelElements": [
                {
                    "modelType": "Operation",
                    "idShort": "GetStatus",
                    "description": [{"language": "en", "text": "Read the line status"}]
                },
                {
                    "modelType": "Operation",
                    "idShort": "EmergencyStop",
                    "description": [{"language": "en", "text": "Emergency stop the line"}],
                    "qualifiers": [{"type": "RiskLevel", "value": "CRITICAL"}]
                }
            ]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!(
            "/submodels/{}/submodel-elements/TasksJson/$value",
            b64url_encode(TASKS_SM)
        )))
        .respond_with(ResponseTemplate::new(404))
        .with_priority(250)
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!(
            "/submodels/{}/submodel-elements/TasksJson/$value",
            b64url_encode(TASKS_SM)
        )))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!(
            "/submodels/{}/submodel-elements/GetStatus/$invoke-async",
            b64url_encode(PLANT_SM)
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(server)
        .await;
}

async fn api_with(settings: Settings) -> Api {
    let server = MockServer::start().await;
    mount_twin(&server).await;

    let twin_breaker = Arc::new(CircuitBreaker::default());
    let twin = Arc::new(
        TwinClient::new(
            TwinConfig {
                aas_base_url: server.uri(),
                submodel_base_url: None,
                timeout: Duration::from_secs(5),
            },
            Arc::clone(&twin_breaker),
        )
        .unwrap(),
    );
    let shadow = Arc::new(ShadowManager::new(
        Arc::clone(&twin),
        ShadowConfig {
            aas_id: AAS_ID.into(),
            aas_repo_id: "default".into(),
            submodel_repo_id: None,
        },
    ));
    shadow.full_sync().await.unwrap();

    let dir = tempfile::TempDir::new().unwrap();
    let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).unwrap());
    let safety = Arc::new(SafetyKernel::new(
        Arc::clone(&shadow),
        Arc::clone(&twin),
        audit,
        KernelConfig {
            policy_submodel_id: POLICY_SM.into(),
            ..KernelConfig::default()
        },
    ));
    let tools = tool_specs(&shadow.get_operations().await);
    let capabilities = Arc::new(PriorityIndex::new(tools, Vec::<String>::new()));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(RulesPlanner::new()),
        Arc::clone(&shadow),
        Arc::clone(&twin),
        Arc::clone(&safety),
        capabilities,
        OrchestratorConfig::default(),
    ));

    let limiter = Arc::new(RateLimiter::new(
        settings.server.rate_limit_rpm,
        settings.server.rate_limit_burst,
    ));
    let state = Arc::new(AppState {
        orchestrator,
        safety,
        shadow,
        bus: Arc::new(EventBusClient::new(BusConfig::default())),
        twin_breaker,
        limiter,
        settings: Arc::new(settings),
        drain: Arc::new(DrainState::default()),
        metrics: Arc::new(Metrics::default()),
        started_at: Instant::now(),
    });
    let app = build_app(Arc::clone(&state));
    Api {
        server,
        app,
        state,
        _dir: dir,
    }
}

async fn api() -> Api {
    let mut settings = Settings::default();
    settings.server.rate_limit_rpm = 6000.0;
    settings.server.rate_limit_burst = Some(100.0);
    api_with(settings).await
}

fn post_json(uri: &str, body: Value, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_always_ok() {
    let api = api().await;
    let response = api.app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["shutting_down"], false);
}

#[tokio::test]
async fn ready_requires_a_connected_bus() {
    let api = api().await;
    let response = api.app.clone().oneshot(get("/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["status"], "not_ready");
    assert_eq!(body["checks"]["bus_connected"], false);
}

#[tokio::test]
async fn chat_runs_a_tool_end_to_end() {
    let api = api().await;
    let response = api
        .app
        .clone()
        .oneshot(post_json(
            "/chat",
            json!({"message": "get status"}),
            &[("x-roles", "operator")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["tool_results"][0]["tool"], "GetStatus");
    assert_eq!(body["tool_results"][0]["success"], true);
    assert_eq!(body["tool_results"][0]["status"], "completed");
    assert_eq!(body["pending_approval"], false);
}

#[tokio::test]
async fn chat_without_message_is_bad_request() {
    let api = api().await;
    let response = api
        .app
        .clone()
        .oneshot(post_json("/chat", json!({}), &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chat_is_refused_while_draining() {
    let api = api().await;
    api.state.drain.trigger_shutdown();
    let response = api
        .app
        .clone()
        .oneshot(post_json(
            "/chat",
            json!({"message": "get status"}),
            &[("x-roles", "operator")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn critical_request_creates_a_task_visible_in_the_api() {
    let api = api().await;
    let response = api
        .app
        .clone()
        .oneshot(post_json(
            "/chat",
            json!({"message": "emergency stop"}),
            &[("x-roles", "operator")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["pending_approval"], true);
    assert!(body["task_id"].as_str().unwrap().starts_with("task-"));
}

#[tokio::test]
async fn task_endpoints_cover_the_lifecycle() {
    let api = api().await;

    // Empty store lists no tasks; unknown ids are 404.
    let response = api.app.clone().oneshot(get("/tasks")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["tasks"], json!([]));

    let response = api.app.clone().oneshot(get("/tasks/task-missing")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // With a pending task in the store, approval flips it.
    let stored = json!({
        "tasks": [{
            "task_id": "task-live",
            "tool": "EmergencyStop",
            "risk": "CRITICAL",
            "requested_by_roles": ["operator"],
            "args": {},
            "safety_reasoning": "stop the line",
            "status": "PendingApproval",
            "created_at": "2026-03-01T10:00:00Z"
        }]
    })
    .to_string();
    Mock::given(method("GET"))
        .and(path(format!(
            "/submodels/{}/submodel-elements/TasksJson/$value",
            b64url_encode(TASKS_SM)
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(stored)))
        .mount(&api.server)
        .await;

    let response = api.app.clone().oneshot(get("/tasks/task-live")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["tool"], "EmergencyStop");

    let response = api
        .app
        .clone()
        .oneshot(post_json(
            "/tasks/task-live/approve",
            json!({"approver": "shift-lead"}),
            &[],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["approved"], true);

    let response = api
        .app
        .clone()
        .oneshot(post_json(
            "/tasks/task-live/reject",
            json!({"reason": "handled manually"}),
            &[],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn rate_limit_answers_429_with_retry_after() {
    let mut settings = Settings::default();
    settings.server.rate_limit_rpm = 60.0;
    settings.server.rate_limit_burst = Some(1.0);
    let api = api_with(settings).await;

    let first = api.app.clone().oneshot(get("/tasks")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = api.app.clone().oneshot(get("/tasks")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after = second.headers().get("retry-after").unwrap();
    assert!(retry_after.to_str().unwrap().parse::<u64>().unwrap() >= 1);

    // Excluded paths bypass the limiter entirely.
    for _ in 0..5 {
        let response = api.app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn distinct_api_keys_get_distinct_buckets() {
    let mut settings = Settings::default();
    settings.server.rate_limit_rpm = 60.0;
    settings.server.rate_limit_burst = Some(1.0);
    let api = api_with(settings).await;

    let mut request = get("/tasks");
    request.headers_mut().insert("x-api-key", "alpha".parse().unwrap());
    assert_eq!(api.app.clone().oneshot(request).await.unwrap().status(), StatusCode::OK);

    let mut request = get("/tasks");
    request.headers_mut().insert("x-api-key", "beta".parse().unwrap());
    assert_eq!(api.app.clone().oneshot(request).await.unwrap().status(), StatusCode::OK);
}

#[tokio::test]
async fn mtls_mode_rejects_requests_without_subject() {
    let mut settings = Settings::default();
    settings.server.auth_mode = AuthMode::Mtls;
    settings.server.rate_limit_rpm = 6000.0;
    let api = api_with(settings).await;

    let response = api
        .app
        .clone()
        .oneshot(post_json("/chat", json!({"message": "get status"}), &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn mtls_subject_maps_to_roles() {
    let mut settings = Settings::default();
    settings.server.auth_mode = AuthMode::Mtls;
    settings.server.rate_limit_rpm = 6000.0;
    settings
        .server
        .subject_roles
        .insert("CN=line-hmi".into(), vec!["operator".into()]);
    let api = api_with(settings).await;

    let response = api
        .app
        .clone()
        .oneshot(post_json(
            "/chat",
            json!({"message": "get status"}),
            &[("x-client-subject", "CN=line-hmi")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["tool_results"][0]["success"], true);
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let api = api().await;
    let response = api.app.clone().oneshot(get("/health")).await.unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn metrics_expose_counters_as_text() {
    let api = api().await;
    let _ = api
        .app
        .clone()
        .oneshot(post_json(
            "/chat",
            json!({"message": "get status"}),
            &[("x-roles", "operator")],
        ))
        .await
        .unwrap();

    let response = api.app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("twinward_chat_requests_total 1"));
    assert!(text.contains("twinward_tool_results_total{status=\"completed\"} 1"));
    assert!(text.contains("twinward_bus_connected 0"));
}

#[tokio::test]
async fn reset_clears_the_conversation() {
    let api = api().await;
    let response = api
        .app
        .clone()
        .oneshot(post_json("/reset", json!({}), &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "conversation reset");
}
