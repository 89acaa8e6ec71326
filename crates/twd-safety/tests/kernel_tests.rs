// SPDX-License-Identifier: MIT OR Apache-2.0

//! Safety kernel tests: RBAC, interlocks, simulation forcing, approval
//! gating, policy verification, and the task lifecycle.

use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use twd_audit::{AuditContext, AuditLog};
use twd_policy::{generate_keypair, sign_policy};
use twd_resilience::CircuitBreaker;
use twd_safety::{EvaluationRequest, KernelConfig, SafetyKernel};
use twd_shadow::{ShadowConfig, ShadowManager};
use twd_twin::{TwinClient, TwinConfig};
use twd_types::{RiskLevel, TaskStatus, b64url_encode};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const AAS_ID: &str = "urn:test:aas:rig";
const POLICY_SM: &str = "urn:test:submodel:policy";
const PLANT_SM: &str = "urn:test:submodel:plant";
const TASKS_SM: &str = "urn:test:submodel:tasks";

struct Fixture {
    server: MockServer,
    kernel: SafetyKernel,
    audit: Arc<AuditLog>,
    _dir: tempfile::TempDir,
}

async fn mount_twin(server: &MockServer, policy_elements: Value, temperature: Option<&str>) {
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
            "submodelElements": policy_elements
        })))
        .mount(server)
        .await;
    let mut plant_elements = vec![];
    if let Some(temperature) = temperature {
        plant_elements.push(json!({
            "modelType": "Property",
            "idShort": "Temperature",
            "valueType": "xs:double",
            "value": temperature
        }));
    }
    Mock::given(method("GET"))
        .and(path(format!("/submodels/{}", b64url_encode(PLANT_SM))))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": PLANT_SM,
            "submodelElements": plant_elements
        })))
        .mount(server)
        .await;
}

fn signed_policy_elements(policy: &Value) -> Value {
    let (private_pem, public_pem) = generate_keypair().unwrap();
    let policy_json = policy.to_string();
    let signature = sign_policy(&policy_json, &private_pem).unwrap();
    json!([
        {"modelType": "Property", "idShort": "PolicyJson", "value": policy_json},
        {"modelType": "Property", "idShort": "PolicyPublicKeyPem", "value": public_pem},
        {"modelType": "Property", "idShort": "PolicySignature", "value": signature}
    ])
}

fn base_policy() -> Value {
    json!({
        "require_simulation_for_risk": "HIGH",
        "require_approval_for_risk": "CRITICAL",
        "role_bindings": {
            "operator": {"allow": ["GetStatus", "SetSpeed"]},
            "admin": {"allow": ["*"]}
        },
        "interlocks": [{
            "id": "overtemp",
            "deny_when": {"submodel": PLANT_SM, "path": "Temperature", "op": ">", "value": 95},
            "message": "Temperature too high for actuation"
        }],
        "task_submodel_id": TASKS_SM,
        "tasks_property_path": "TasksJson"
    })
}

async fn fixture(policy_elements: Value, temperature: Option<&str>, config: KernelConfig) -> Fixture {
    let server = MockServer::start().await;
    mount_twin(&server, policy_elements, temperature).await;

    let twin = Arc::new(
        TwinClient::new(
            TwinConfig {
                aas_base_url: server.uri(),
                submodel_base_url: None,
                timeout: Duration::from_secs(5),
            },
            Arc::new(CircuitBreaker::default()),
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
    let kernel = SafetyKernel::new(shadow, twin, Arc::clone(&audit), config);
    Fixture {
        server,
        kernel,
        audit,
        _dir: dir,
    }
}

fn kernel_config() -> KernelConfig {
    KernelConfig {
        policy_submodel_id: POLICY_SM.into(),
        require_policy_verification: true,
        interlock_fail_safe: true,
        policy_cache_ttl: Duration::from_secs(300),
        policy_max_age: None,
        approval_poll_interval: Duration::from_millis(10),
    }
}

fn request(tool: &str, risk: RiskLevel, roles: &[&str], params: Value) -> EvaluationRequest {
    let params: Map<String, Value> = params.as_object().cloned().unwrap_or_default();
    EvaluationRequest {
        tool_name: tool.into(),
        risk,
        roles: roles.iter().map(|r| (*r).to_string()).collect(),
        params,
        action_id: Some("action-1".into()),
        shadow_freshness: Some(0.5),
    }
}

fn audit_events(audit: &AuditLog) -> Vec<(String, Value)> {
    let content = std::fs::read_to_string(audit.path()).unwrap();
    content
        .lines()
        .map(|l| {
            let entry: Value = serde_json::from_str(l).unwrap();
            (entry["event"].as_str().unwrap().to_string(), entry)
        })
        .collect()
}

#[tokio::test]
async fn rbac_denies_unbound_tool_and_audits() {
    let f = fixture(signed_policy_elements(&base_policy()), Some("20"), kernel_config()).await;
    let ctx = AuditContext::default();

    let decision = f
        .kernel
        .evaluate(&request("EmergencyStop", RiskLevel::Critical, &["operator"], json!({})), &ctx)
        .await;
    assert!(!decision.allowed);
    assert!(decision.reason.as_deref().unwrap().contains("not authorized"));

    let events = audit_events(&f.audit);
    let denied = events.iter().find(|(e, _)| e == "denied").unwrap();
    assert_eq!(denied.1["reason"], "rbac");
    assert!(events.iter().any(|(e, _)| e == "intent"));
}

#[tokio::test]
async fn rbac_wildcard_allows_everything() {
    let f = fixture(signed_policy_elements(&base_policy()), Some("20"), kernel_config()).await;
    let ctx = AuditContext::default();
    let decision = f
        .kernel
        .evaluate(&request("AnythingAtAll", RiskLevel::Low, &["admin"], json!({})), &ctx)
        .await;
    assert!(decision.allowed);
}

#[tokio::test]
async fn empty_role_bindings_permit_all() {
    let policy = json!({"role_bindings": {}, "task_submodel_id": TASKS_SM});
    let f = fixture(signed_policy_elements(&policy), Some("20"), kernel_config()).await;
    let decision = f
        .kernel
        .evaluate(
            &request("GetStatus", RiskLevel::Low, &["viewer"], json!({})),
            &AuditContext::default(),
        )
        .await;
    assert!(decision.allowed);
}

#[tokio::test]
async fn interlock_fires_on_threshold_violation() {
    let f = fixture(signed_policy_elements(&base_policy()), Some("100"), kernel_config()).await;
    let ctx = AuditContext::default();
    let decision = f
        .kernel
        .evaluate(&request("SetSpeed", RiskLevel::Low, &["operator"], json!({})), &ctx)
        .await;
    assert!(!decision.allowed);
    assert_eq!(decision.reason.as_deref(), Some("Temperature too high for actuation"));

    let events = audit_events(&f.audit);
    let denied = events.iter().find(|(e, _)| e == "denied").unwrap();
    assert_eq!(denied.1["reason"], "interlock");
}

#[tokio::test]
async fn interlock_passes_below_threshold() {
    let f = fixture(signed_policy_elements(&base_policy()), Some("80"), kernel_config()).await;
    let decision = f
        .kernel
        .evaluate(
            &request("GetStatus", RiskLevel::Low, &["operator"], json!({})),
            &AuditContext::default(),
        )
        .await;
    assert!(decision.allowed);
}

#[tokio::test]
async fn missing_interlock_property_denies_in_fail_safe_mode() {
    let f = fixture(signed_policy_elements(&base_policy()), None, kernel_config()).await;
    let decision = f
        .kernel
        .evaluate(
            &request("GetStatus", RiskLevel::Low, &["operator"], json!({})),
            &AuditContext::default(),
        )
        .await;
    assert!(!decision.allowed);
    assert!(decision.reason.as_deref().unwrap().contains("fail-safe"));
}

#[tokio::test]
async fn missing_interlock_property_skips_when_fail_open() {
    let config = KernelConfig {
        interlock_fail_safe: false,
        ..kernel_config()
    };
    let f = fixture(signed_policy_elements(&base_policy()), None, config).await;
    let decision = f
        .kernel
        .evaluate(
            &request("GetStatus", RiskLevel::Low, &["operator"], json!({})),
            &AuditContext::default(),
        )
        .await;
    assert!(decision.allowed);
}

#[tokio::test]
async fn simulation_forced_at_and_above_threshold() {
    let f = fixture(signed_policy_elements(&base_policy()), Some("20"), kernel_config()).await;
    let ctx = AuditContext::default();

    let high = f
        .kernel
        .evaluate(&request("SetSpeed", RiskLevel::High, &["operator"], json!({})), &ctx)
        .await;
    assert!(high.allowed);
    assert!(high.force_simulation);

    let already = f
        .kernel
        .evaluate(
            &request("SetSpeed", RiskLevel::High, &["operator"], json!({"simulate": true})),
            &ctx,
        )
        .await;
    assert!(!already.force_simulation);

    // An explicit simulate=false is still forced; only simulate=true counts
    // as already simulating.
    let explicit_false = f
        .kernel
        .evaluate(
            &request("SetSpeed", RiskLevel::High, &["operator"], json!({"simulate": false})),
            &ctx,
        )
        .await;
    assert!(explicit_false.force_simulation);

    let low = f
        .kernel
        .evaluate(&request("GetStatus", RiskLevel::Low, &["operator"], json!({})), &ctx)
        .await;
    assert!(!low.force_simulation);
}

#[tokio::test]
async fn approval_required_at_critical() {
    let f = fixture(signed_policy_elements(&base_policy()), Some("20"), kernel_config()).await;
    let decision = f
        .kernel
        .evaluate(
            &request("AnythingAtAll", RiskLevel::Critical, &["admin"], json!({})),
            &AuditContext::default(),
        )
        .await;
    assert!(decision.allowed);
    assert!(decision.require_approval);
    assert!(decision.force_simulation);
}

#[tokio::test]
async fn tampered_policy_denies_with_policy_reason() {
    let mut elements = signed_policy_elements(&base_policy());
    // Corrupt one byte of the stored policy JSON.
    let tampered = elements[0]["value"].as_str().unwrap().replacen("HIGH", "HIGh", 1);
    elements[0]["value"] = json!(tampered);
    let f = fixture(elements, Some("20"), kernel_config()).await;
    let ctx = AuditContext::default();

    let decision = f
        .kernel
        .evaluate(&request("GetStatus", RiskLevel::Low, &["admin"], json!({})), &ctx)
        .await;
    assert!(!decision.allowed);
    assert_eq!(decision.reason.as_deref(), Some("Policy verification failed"));

    let events = audit_events(&f.audit);
    let denied = events.iter().find(|(e, _)| e == "denied").unwrap();
    assert_eq!(denied.1["reason"], "policy");
}

#[tokio::test]
async fn unsigned_policy_rejected_when_verification_required() {
    let elements = json!([
        {"modelType": "Property", "idShort": "PolicyJson", "value": base_policy().to_string()}
    ]);
    let f = fixture(elements, Some("20"), kernel_config()).await;
    let decision = f
        .kernel
        .evaluate(
            &request("GetStatus", RiskLevel::Low, &["admin"], json!({})),
            &AuditContext::default(),
        )
        .await;
    assert!(!decision.allowed);
}

#[tokio::test]
async fn unsigned_policy_accepted_when_verification_disabled() {
    let elements = json!([
        {"modelType": "Property", "idShort": "PolicyJson", "value": base_policy().to_string()}
    ]);
    let config = KernelConfig {
        require_policy_verification: false,
        ..kernel_config()
    };
    let f = fixture(elements, Some("20"), config).await;
    let ctx = AuditContext::default();
    let policy = f.kernel.load_policy(false, &ctx).await.unwrap();
    assert_eq!(policy.task_submodel_id, TASKS_SM);
    assert!(!f.kernel.policy_verified().await);

    let events = audit_events(&f.audit);
    let loaded = events.iter().find(|(e, _)| e == "policy_loaded").unwrap();
    assert_eq!(loaded.1["source"], "unsigned");
    assert_eq!(loaded.1["verified"], false);
}

#[tokio::test]
async fn signed_policy_load_audits_hash_and_source() {
    let f = fixture(signed_policy_elements(&base_policy()), Some("20"), kernel_config()).await;
    let ctx = AuditContext::default();
    f.kernel.load_policy(false, &ctx).await.unwrap();
    assert!(f.kernel.policy_verified().await);

    let events = audit_events(&f.audit);
    let loaded = events.iter().find(|(e, _)| e == "policy_loaded").unwrap();
    assert_eq!(loaded.1["source"], "signed");
    assert_eq!(loaded.1["verified"], true);
    assert_eq!(loaded.1["policy_hash"].as_str().unwrap().len(), 64);
}

#[tokio::test]
async fn defaults_apply_without_policy_submodel_when_allowed() {
    let server = MockServer::start().await;
    // Shell references only the plant submodel; no policy twin exists.
    Mock::given(method("GET"))
        .and(path(format!("/shells/{}", b64url_encode(AAS_ID))))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": AAS_ID})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/shells/{}/submodel-refs", b64url_encode(AAS_ID))))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": []})))
        .mount(&server)
        .await;

    let twin = Arc::new(
        TwinClient::new(
            TwinConfig {
                aas_base_url: server.uri(),
                submodel_base_url: None,
                timeout: Duration::from_secs(5),
            },
            Arc::new(CircuitBreaker::default()),
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
    let config = KernelConfig {
        require_policy_verification: false,
        ..kernel_config()
    };
    let kernel = SafetyKernel::new(shadow, twin, Arc::clone(&audit), config);

    let policy = kernel.load_policy(false, &AuditContext::default()).await.unwrap();
    assert_eq!(policy.require_approval_for_risk, RiskLevel::Critical);
    let events = audit_events(&audit);
    let loaded = events.iter().find(|(e, _)| e == "policy_loaded").unwrap();
    assert_eq!(loaded.1["source"], "default");
    assert_eq!(loaded.1["verified"], false);
}

#[tokio::test]
async fn approval_task_lifecycle() {
    let f = fixture(signed_policy_elements(&base_policy()), Some("20"), kernel_config()).await;
    let ctx = AuditContext::default();

    // Empty store; accept the rewrite.
    Mock::given(method("GET"))
        .and(path(format!(
            "/submodels/{}/submodel-elements/TasksJson/$value",
            b64url_encode(TASKS_SM)
        )))
        .respond_with(ResponseTemplate::new(404))
        .mount(&f.server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!(
            "/submodels/{}/submodel-elements/TasksJson/$value",
            b64url_encode(TASKS_SM)
        )))
        .respond_with(ResponseTemplate::new(204))
        .mount(&f.server)
        .await;

    let req = request(
        "EmergencyStop",
        RiskLevel::Critical,
        &["operator"],
        json!({"simulate": false, "safety_reasoning": "operator asked for e-stop", "Zone": "A"}),
    );
    let task_id = f.kernel.create_approval_task(&req, None, &ctx).await.unwrap();
    assert!(task_id.starts_with("task-"));

    let events = audit_events(&f.audit);
    let requested = events.iter().find(|(e, _)| e == "approval_requested").unwrap();
    assert_eq!(requested.1["task_id"], json!(task_id));

    // Now the store holds that pending task; approving flips it.
    f.server.reset().await;
    mount_twin(&f.server, signed_policy_elements(&base_policy()), Some("20")).await;
    let stored = json!({
        "tasks": [{
            "task_id": task_id,
            "tool": "EmergencyStop",
            "risk": "CRITICAL",
            "requested_by_roles": ["operator"],
            "args": {"Zone": "A"},
            "safety_reasoning": "operator asked for e-stop",
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
        .mount(&f.server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!(
            "/submodels/{}/submodel-elements/TasksJson/$value",
            b64url_encode(TASKS_SM)
        )))
        .respond_with(ResponseTemplate::new(204))
        .mount(&f.server)
        .await;

    assert!(f.kernel.approve_task(&task_id, "supervisor", &ctx).await.unwrap());
    assert_eq!(
        f.kernel.check_task_status(&task_id, &ctx).await.unwrap(),
        TaskStatus::PendingApproval // store mock is static; status read reflects it
    );

    // A task already out of PendingApproval is a no-op returning false.
    f.server.reset().await;
    mount_twin(&f.server, signed_policy_elements(&base_policy()), Some("20")).await;
    let approved_store = stored.replace("PendingApproval", "Approved");
    Mock::given(method("GET"))
        .and(path(format!(
            "/submodels/{}/submodel-elements/TasksJson/$value",
            b64url_encode(TASKS_SM)
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(approved_store)))
        .mount(&f.server)
        .await;

    let audit_len_before = audit_events(&f.audit).len();
    assert!(!f.kernel.approve_task(&task_id, "supervisor", &ctx).await.unwrap());
    assert!(!f.kernel.reject_task(&task_id, "supervisor", "late", &ctx).await.unwrap());
    // No new approved/rejected audit entries were written.
    assert_eq!(audit_events(&f.audit).len(), audit_len_before);

    // wait_for_approval sees the approved store immediately.
    let (approved, reason) = f
        .kernel
        .wait_for_approval(&task_id, Duration::from_millis(200), &ctx)
        .await
        .unwrap();
    assert!(approved, "{reason}");
}

#[tokio::test]
async fn wait_for_approval_times_out_and_audits() {
    let f = fixture(signed_policy_elements(&base_policy()), Some("20"), kernel_config()).await;
    let ctx = AuditContext::default();
    let stored = json!({
        "tasks": [{
            "task_id": "task-wait",
            "tool": "EmergencyStop",
            "risk": "CRITICAL",
            "requested_by_roles": ["operator"],
            "args": {},
            "safety_reasoning": "x",
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
        .mount(&f.server)
        .await;

    let (approved, reason) = f
        .kernel
        .wait_for_approval("task-wait", Duration::from_millis(50), &ctx)
        .await
        .unwrap();
    assert!(!approved);
    assert_eq!(reason, "Approval timeout");
    assert!(audit_events(&f.audit).iter().any(|(e, _)| e == "timeout"));
}
