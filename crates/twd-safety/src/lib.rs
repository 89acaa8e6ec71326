// SPDX-License-Identifier: MIT OR Apache-2.0

//! The safety kernel: single choke point for every operation call.
//!
//! Evaluation layers, in order: signed-policy load (cached), RBAC, interlock
//! predicates over shadow state, simulation forcing, approval gating. Every
//! stage writes exactly one audit entry with a matching event tag.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use twd_audit::{AuditContext, AuditEvent, AuditFields, AuditLog};
use twd_policy::{PolicyConfig, PolicyError, policy_hash};
use twd_shadow::ShadowManager;
use twd_twin::{TwinClient, TwinError};
use twd_types::{ApprovalTask, RiskLevel, TaskStatus};
use uuid::Uuid;

/// Errors from kernel task-store operations.
#[derive(Debug, thiserror::Error)]
pub enum SafetyError {
    /// Policy could not be loaded or verified.
    #[error(transparent)]
    Policy(#[from] PolicyError),
    /// The twin-backed task store could not be read or written.
    #[error(transparent)]
    Twin(#[from] TwinError),
}

/// Kernel tuning knobs.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Submodel id of the PolicyTwin.
    pub policy_submodel_id: String,
    /// Reject unsigned or unverifiable policies.
    pub require_policy_verification: bool,
    /// Deny when an interlock property is missing from the shadow.
    pub interlock_fail_safe: bool,
    /// How long a loaded policy is served from cache.
    pub policy_cache_ttl: Duration,
    /// Hard upper bound on cached-policy age, forcing a reload.
    pub policy_max_age: Option<Duration>,
    /// Poll interval while waiting for human approval.
    pub approval_poll_interval: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            policy_submodel_id: String::new(),
            require_policy_verification: true,
            interlock_fail_safe: true,
            policy_cache_ttl: Duration::from_secs(300),
            policy_max_age: None,
            approval_poll_interval: Duration::from_secs(2),
        }
    }
}

/// Inputs to one safety evaluation.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    /// Tool name.
    pub tool_name: String,
    /// Risk level of the tool.
    pub risk: RiskLevel,
    /// Caller roles.
    pub roles: Vec<String>,
    /// Proposed call arguments.
    pub params: Map<String, Value>,
    /// Idempotency key of the call.
    pub action_id: Option<String>,
    /// Age of the shadow replica in seconds, for the audit trail.
    pub shadow_freshness: Option<f64>,
}

/// Outcome of a safety evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SafetyDecision {
    /// Whether the call may proceed at all.
    pub allowed: bool,
    /// Denial reason, when not allowed.
    pub reason: Option<String>,
    /// The call must run as a simulation first.
    pub force_simulation: bool,
    /// The call needs human approval before a real execution.
    pub require_approval: bool,
}

impl SafetyDecision {
    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
struct CachedPolicy {
    config: PolicyConfig,
    verified: bool,
    loaded_at: Instant,
}

/// Multi-layer authorization kernel.
pub struct SafetyKernel {
    shadow: Arc<ShadowManager>,
    twin: Arc<TwinClient>,
    audit: Arc<AuditLog>,
    config: KernelConfig,
    cache: Mutex<Option<CachedPolicy>>,
}

impl SafetyKernel {
    /// Create a kernel over the shadow, twin transport and audit log.
    #[must_use]
    pub fn new(
        shadow: Arc<ShadowManager>,
        twin: Arc<TwinClient>,
        audit: Arc<AuditLog>,
        config: KernelConfig,
    ) -> Self {
        Self {
            shadow,
            twin,
            audit,
            config,
            cache: Mutex::new(None),
        }
    }

    /// The audit log this kernel writes to.
    #[must_use]
    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Audit failures never block the governed call; the chain self-heals on
    /// the next append thanks to the locked re-read.
    fn audit(&self, event: AuditEvent, fields: AuditFields, ctx: &AuditContext) {
        if let Err(err) = self.audit.append(event, fields, ctx) {
            error!(event = %event, error = %err, "audit append failed");
        }
    }

    // -- Policy -------------------------------------------------------------

    /// Load the policy, serving from cache within the TTL.
    ///
    /// # Errors
    ///
    /// [`PolicyError`] when verification is required and no acceptable policy
    /// exists.
    pub async fn load_policy(
        &self,
        force_reload: bool,
        ctx: &AuditContext,
    ) -> Result<PolicyConfig, PolicyError> {
        let mut cache = self.cache.lock().await;
        if !force_reload
            && let Some(cached) = cache.as_ref()
        {
            let age = cached.loaded_at.elapsed();
            let stale = self.config.policy_max_age.is_some_and(|max| age > max);
            if stale {
                warn!(
                    age_secs = age.as_secs_f64(),
                    "cached policy exceeded max age, forcing reload"
                );
            } else if age < self.config.policy_cache_ttl {
                return Ok(cached.config.clone());
            }
        }

        let Some(submodel) = self.shadow.get_submodel(&self.config.policy_submodel_id).await
        else {
            if self.config.require_policy_verification {
                return Err(PolicyError::NotFound);
            }
            warn!("policy submodel not found, using defaults");
            self.audit(
                AuditEvent::PolicyLoaded,
                AuditFields::new().with("verified", false).with("source", "default"),
                ctx,
            );
            let config = PolicyConfig::default();
            *cache = Some(CachedPolicy {
                config: config.clone(),
                verified: false,
                loaded_at: Instant::now(),
            });
            return Ok(config);
        };

        if let Some(signed) = twd_policy::extract_signed_policy(&submodel) {
            let (config, verified) =
                twd_policy::verify_and_parse(&signed, self.config.require_policy_verification)?;
            self.audit(
                AuditEvent::PolicyLoaded,
                AuditFields::new()
                    .with("policy_hash", policy_hash(&signed.policy_json))
                    .with("verified", verified)
                    .with("source", "signed"),
                ctx,
            );
            info!(
                verified,
                interlocks = config.interlocks.len(),
                "policy loaded"
            );
            *cache = Some(CachedPolicy {
                config: config.clone(),
                verified,
                loaded_at: Instant::now(),
            });
            return Ok(config);
        }

        if let Some(raw) = twd_policy::extract_unsigned_policy(&submodel) {
            self.audit(
                AuditEvent::PolicyLoaded,
                AuditFields::new()
                    .with("policy_hash", policy_hash(&raw))
                    .with("verified", false)
                    .with("source", "unsigned"),
                ctx,
            );
            if self.config.require_policy_verification {
                error!("unsigned policy rejected");
                return Err(PolicyError::UnsignedRejected);
            }
            let config: PolicyConfig = serde_json::from_str(&raw)?;
            *cache = Some(CachedPolicy {
                config: config.clone(),
                verified: false,
                loaded_at: Instant::now(),
            });
            return Ok(config);
        }

        if self.config.require_policy_verification {
            return Err(PolicyError::NotFound);
        }
        self.audit(
            AuditEvent::PolicyLoaded,
            AuditFields::new().with("verified", false).with("source", "default"),
            ctx,
        );
        let config = PolicyConfig::default();
        *cache = Some(CachedPolicy {
            config: config.clone(),
            verified: false,
            loaded_at: Instant::now(),
        });
        Ok(config)
    }

    /// Whether the cached policy was signature-verified.
    pub async fn policy_verified(&self) -> bool {
        self.cache.lock().await.as_ref().is_some_and(|c| c.verified)
    }

    // -- Evaluation ---------------------------------------------------------

    /// Evaluate whether a tool call may proceed, and under which conditions.
    pub async fn evaluate(
        &self,
        request: &EvaluationRequest,
        ctx: &AuditContext,
    ) -> SafetyDecision {
        let policy = match self.load_policy(false, ctx).await {
            Ok(policy) => policy,
            Err(err) => {
                error!(error = %err, "policy load failed during evaluation");
                self.audit(
                    AuditEvent::Denied,
                    AuditFields::new()
                        .with("tool", &request.tool_name)
                        .with("reason", "policy")
                        .with("error", err.to_string()),
                    ctx,
                );
                return SafetyDecision::deny("Policy verification failed");
            }
        };

        self.audit(
            AuditEvent::Intent,
            AuditFields::new()
                .with("tool", &request.tool_name)
                .with("risk", request.risk)
                .with("roles", &request.roles)
                .with("params", Value::Object(request.params.clone()))
                .with("action_id", request.action_id.clone())
                .with("shadow_freshness", request.shadow_freshness),
            ctx,
        );

        // Layer 1: RBAC.
        if !check_rbac(&policy, &request.tool_name, &request.roles) {
            self.audit(
                AuditEvent::Denied,
                AuditFields::new()
                    .with("tool", &request.tool_name)
                    .with("reason", "rbac")
                    .with("roles", &request.roles),
                ctx,
            );
            return SafetyDecision::deny(format!(
                "Role(s) {:?} not authorized for {}",
                request.roles, request.tool_name
            ));
        }

        // Layer 2: interlocks.
        if let Some(message) = self.evaluate_interlocks(&policy).await {
            self.audit(
                AuditEvent::Denied,
                AuditFields::new()
                    .with("tool", &request.tool_name)
                    .with("reason", "interlock")
                    .with("message", &message),
                ctx,
            );
            return SafetyDecision::deny(message);
        }

        // Layer 3: simulation forcing.
        let already_simulating = request
            .params
            .get("simulate")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let force_simulation =
            !already_simulating && request.risk >= policy.require_simulation_for_risk;

        // Layer 4: approval gating.
        let require_approval = request.risk >= policy.require_approval_for_risk;

        SafetyDecision {
            allowed: true,
            reason: None,
            force_simulation,
            require_approval,
        }
    }

    /// First interlock violation wins; returns its operator-facing message.
    async fn evaluate_interlocks(&self, policy: &PolicyConfig) -> Option<String> {
        for rule in &policy.interlocks {
            let current = self
                .shadow
                .get_property_value(&rule.deny_when.submodel, &rule.deny_when.path)
                .await;
            let Some(current) = current else {
                warn!(
                    interlock_id = %rule.id,
                    submodel_id = %rule.deny_when.submodel,
                    path = %rule.deny_when.path,
                    fail_safe = self.config.interlock_fail_safe,
                    "interlock property not found in shadow"
                );
                if self.config.interlock_fail_safe {
                    return Some(format!(
                        "Safety interlock {} cannot be evaluated: property {} not found in \
                         submodel {}. Operation denied for safety (fail-safe mode).",
                        rule.id, rule.deny_when.path, rule.deny_when.submodel
                    ));
                }
                continue;
            };
            if twd_policy::violates(&current, rule.deny_when.op, &rule.deny_when.value) {
                return Some(rule.denial_message());
            }
        }
        None
    }

    // -- Approval tasks -----------------------------------------------------

    /// Create a `PendingApproval` task in the twin-backed store.
    ///
    /// # Errors
    ///
    /// Policy load or task-store write failures.
    pub async fn create_approval_task(
        &self,
        request: &EvaluationRequest,
        simulation_result: Option<Value>,
        ctx: &AuditContext,
    ) -> Result<String, SafetyError> {
        let policy = self.load_policy(false, ctx).await?;
        let task_id = format!("task-{}", &Uuid::new_v4().simple().to_string()[..8]);

        // Safety fields are call plumbing, not operator-reviewable arguments.
        let args: Map<String, Value> = request
            .params
            .iter()
            .filter(|(k, _)| k.as_str() != "simulate" && k.as_str() != "safety_reasoning")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let safety_reasoning = request
            .params
            .get("safety_reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let task = ApprovalTask {
            task_id: task_id.clone(),
            tool: request.tool_name.clone(),
            risk: request.risk,
            requested_by_roles: request.roles.clone(),
            args,
            safety_reasoning,
            status: TaskStatus::PendingApproval,
            created_at: Utc::now(),
            action_id: request.action_id.clone(),
            simulate_result: simulation_result,
            approved_by: None,
            approved_at: None,
            rejected_by: None,
            rejected_at: None,
            rejection_reason: None,
        };

        self.twin
            .add_task(&policy.task_submodel_id, &policy.tasks_property_path, task)
            .await?;

        self.audit(
            AuditEvent::ApprovalRequested,
            AuditFields::new()
                .with("tool", &request.tool_name)
                .with("task_id", &task_id)
                .with("roles", &request.roles)
                .with("action_id", request.action_id.clone()),
            ctx,
        );
        info!(task_id = %task_id, tool = %request.tool_name, "approval task created");
        Ok(task_id)
    }

    /// All tasks in the store.
    ///
    /// # Errors
    ///
    /// Policy load failures.
    pub async fn get_all_tasks(&self, ctx: &AuditContext) -> Result<Vec<ApprovalTask>, SafetyError> {
        let policy = self.load_policy(false, ctx).await?;
        Ok(self
            .twin
            .get_tasks(&policy.task_submodel_id, &policy.tasks_property_path)
            .await)
    }

    /// All tasks still awaiting a decision.
    ///
    /// # Errors
    ///
    /// Policy load failures.
    pub async fn get_pending_tasks(
        &self,
        ctx: &AuditContext,
    ) -> Result<Vec<ApprovalTask>, SafetyError> {
        Ok(self
            .get_all_tasks(ctx)
            .await?
            .into_iter()
            .filter(|t| t.status == TaskStatus::PendingApproval)
            .collect())
    }

    /// Look up one task.
    ///
    /// # Errors
    ///
    /// Policy load failures.
    pub async fn get_task(
        &self,
        task_id: &str,
        ctx: &AuditContext,
    ) -> Result<Option<ApprovalTask>, SafetyError> {
        Ok(self
            .get_all_tasks(ctx)
            .await?
            .into_iter()
            .find(|t| t.task_id == task_id))
    }

    /// Current status of a task; [`TaskStatus::Expired`] when absent.
    ///
    /// # Errors
    ///
    /// Policy load failures.
    pub async fn check_task_status(
        &self,
        task_id: &str,
        ctx: &AuditContext,
    ) -> Result<TaskStatus, SafetyError> {
        Ok(self
            .get_task(task_id, ctx)
            .await?
            .map_or(TaskStatus::Expired, |t| t.status))
    }

    /// Approve a pending task.
    ///
    /// Returns `false` without re-auditing when the task is missing or not
    /// pending.
    ///
    /// # Errors
    ///
    /// Policy load or task-store write failures.
    pub async fn approve_task(
        &self,
        task_id: &str,
        approver: &str,
        ctx: &AuditContext,
    ) -> Result<bool, SafetyError> {
        let policy = self.load_policy(false, ctx).await?;
        let mut tasks = self
            .twin
            .get_tasks(&policy.task_submodel_id, &policy.tasks_property_path)
            .await;
        let Some(task) = tasks.iter_mut().find(|t| t.task_id == task_id) else {
            warn!(task_id, "task not found for approval");
            return Ok(false);
        };
        if task.status != TaskStatus::PendingApproval {
            warn!(task_id, status = ?task.status, "cannot approve task, not pending");
            return Ok(false);
        }
        task.status = TaskStatus::Approved;
        task.approved_by = Some(approver.to_string());
        task.approved_at = Some(Utc::now());

        self.twin
            .update_tasks(&policy.task_submodel_id, &policy.tasks_property_path, &tasks)
            .await?;
        self.audit(
            AuditEvent::Approved,
            AuditFields::new()
                .with("task_id", task_id)
                .with("approved_by", approver),
            ctx,
        );
        info!(task_id, approved_by = approver, "task approved");
        Ok(true)
    }

    /// Reject a pending task.
    ///
    /// # Errors
    ///
    /// Policy load or task-store write failures.
    pub async fn reject_task(
        &self,
        task_id: &str,
        rejector: &str,
        reason: &str,
        ctx: &AuditContext,
    ) -> Result<bool, SafetyError> {
        let policy = self.load_policy(false, ctx).await?;
        let mut tasks = self
            .twin
            .get_tasks(&policy.task_submodel_id, &policy.tasks_property_path)
            .await;
        let Some(task) = tasks.iter_mut().find(|t| t.task_id == task_id) else {
            warn!(task_id, "task not found for rejection");
            return Ok(false);
        };
        if task.status != TaskStatus::PendingApproval {
            warn!(task_id, status = ?task.status, "cannot reject task, not pending");
            return Ok(false);
        }
        task.status = TaskStatus::Rejected;
        task.rejected_by = Some(rejector.to_string());
        task.rejected_at = Some(Utc::now());
        task.rejection_reason = Some(reason.to_string());

        self.twin
            .update_tasks(&policy.task_submodel_id, &policy.tasks_property_path, &tasks)
            .await?;
        self.audit(
            AuditEvent::Rejected,
            AuditFields::new()
                .with("task_id", task_id)
                .with("rejected_by", rejector)
                .with("reason", reason),
            ctx,
        );
        info!(task_id, rejected_by = rejector, "task rejected");
        Ok(true)
    }

    /// Poll until a task reaches a terminal status or the timeout passes.
    ///
    /// Returns `(approved, reason)`. The approval and rejection transitions
    /// themselves were already audited by whoever flipped the task.
    ///
    /// # Errors
    ///
    /// Policy load failures.
    pub async fn wait_for_approval(
        &self,
        task_id: &str,
        timeout: Duration,
        ctx: &AuditContext,
    ) -> Result<(bool, String), SafetyError> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            match self.check_task_status(task_id, ctx).await? {
                TaskStatus::Approved => return Ok((true, "Task approved".into())),
                TaskStatus::Rejected => {
                    return Ok((false, "Task rejected by human operator".into()));
                }
                TaskStatus::Expired => return Ok((false, "Task not found or expired".into())),
                TaskStatus::PendingApproval => {
                    tokio::time::sleep(self.config.approval_poll_interval).await;
                }
            }
        }
        self.audit(
            AuditEvent::Timeout,
            AuditFields::new().with("task_id", task_id),
            ctx,
        );
        Ok((false, "Approval timeout".into()))
    }

    // -- Execution bookkeeping ----------------------------------------------

    /// Audit a successful execution or simulation.
    pub fn log_execution(
        &self,
        tool_name: &str,
        risk: RiskLevel,
        roles: &[String],
        result: &Value,
        simulated: bool,
        action_id: Option<&str>,
        ctx: &AuditContext,
    ) {
        let event = if simulated {
            AuditEvent::Simulated
        } else {
            AuditEvent::Executed
        };
        self.audit(
            event,
            AuditFields::new()
                .with("tool", tool_name)
                .with("risk", risk)
                .with("roles", roles)
                .with("result", result)
                .with("action_id", action_id),
            ctx,
        );
    }

    /// Audit a failed execution.
    pub fn log_error(
        &self,
        tool_name: &str,
        roles: &[String],
        error: &str,
        action_id: Option<&str>,
        ctx: &AuditContext,
    ) {
        self.audit(
            AuditEvent::Error,
            AuditFields::new()
                .with("tool", tool_name)
                .with("roles", roles)
                .with("error", error)
                .with("action_id", action_id),
            ctx,
        );
    }
}

/// Empty role bindings permit everything; otherwise any role whose binding
/// carries `*` or the tool name passes.
fn check_rbac(policy: &PolicyConfig, tool_name: &str, roles: &[String]) -> bool {
    if policy.role_bindings.is_empty() {
        return true;
    }
    roles.iter().any(|role| {
        policy
            .role_bindings
            .get(role)
            .is_some_and(|binding| binding.allows(tool_name))
    })
}
