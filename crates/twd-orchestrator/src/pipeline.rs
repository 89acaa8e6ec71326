// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request processing and the per-call tool pipeline.

use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};
use twd_audit::AuditContext;
use twd_capability::{PriorityIndex, ToolSpec};
use twd_llm::{ChatMessage, LmClient, LmError, ToolDescriptor};
use twd_safety::{EvaluationRequest, SafetyError, SafetyKernel};
use twd_shadow::ShadowManager;
use twd_twin::{TwinClient, TwinError};
use twd_types::{JobState, TaskStatus};
use uuid::Uuid;

/// System instructions handed to the model on every request.
const SYSTEM_PROMPT: &str = "\
You are an AI assistant controlling industrial equipment through a digital twin interface.

You have access to operations that control real equipment. Follow these guidelines:
1. Always provide safety_reasoning explaining why an action is appropriate
2. For high-risk operations, consider using simulate=true first
3. If an interlock or safety check fails, explain the issue to the user
4. Monitor job status for long-running operations

Be concise and focus on the task at hand.";

/// Roles that may execute any approved task on the requester's behalf.
const PRIVILEGED_ROLES: &[&str] = &["admin", "maintenance", "supervisor"];

/// Errors that abort a whole request (per-call faults become tool results).
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The model call failed and no fallback absorbed it.
    #[error(transparent)]
    Lm(#[from] LmError),
    /// The kernel could not serve the request at all.
    #[error(transparent)]
    Safety(#[from] SafetyError),
}

/// Terminal status of one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// Executed (or its async job reached a terminal state).
    Completed,
    /// The kernel denied the call.
    Denied,
    /// Ran as a simulation only; re-issue with `simulate=false` to execute.
    SimulatedOnly,
    /// Held for human approval.
    PendingApproval,
    /// Failed before or during invocation.
    Error,
}

/// Result of one tool call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    /// Tool name.
    pub tool: String,
    /// Whether the call succeeded (denials and errors are failures).
    pub success: bool,
    /// Twin response or terminal job record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the invocation ran in simulation.
    pub simulated: bool,
    /// Async job id, when the twin returned one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Approval task id, when the call was gated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Call status.
    pub status: ToolStatus,
    /// Idempotency key of this call.
    pub action_id: Option<String>,
}

impl ToolResult {
    fn error(tool: &str, action_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            tool: tool.to_string(),
            success: false,
            result: None,
            error: Some(message.into()),
            simulated: false,
            job_id: None,
            task_id: None,
            status: ToolStatus::Error,
            action_id,
        }
    }
}

/// Complete response to one user message.
#[derive(Debug, Clone, Serialize)]
pub struct AgentReply {
    /// Natural-language reply.
    pub reply: Option<String>,
    /// Per-call results, in model order.
    pub tool_results: Vec<ToolResult>,
    /// Whether any call is held for approval.
    pub pending_approval: bool,
    /// Task id of the first held call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl AgentReply {
    fn text(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
            tool_results: Vec::new(),
            pending_approval: false,
            task_id: None,
        }
    }

    fn with_results(reply: String, tool_results: Vec<ToolResult>) -> Self {
        let held = tool_results
            .iter()
            .find(|r| r.status == ToolStatus::PendingApproval);
        let pending_approval = held.is_some();
        let task_id = held.and_then(|r| r.task_id.clone());
        Self {
            reply: Some(reply),
            tool_results,
            pending_approval,
            task_id,
        }
    }
}

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Tools retrieved per query.
    pub capability_top_k: usize,
    /// Shadow poll interval while monitoring a job.
    pub job_poll_interval: Duration,
    /// Overall job deadline.
    pub job_timeout: Duration,
    /// Consecutive stale polls before one direct HTTP status check.
    pub job_http_fallback_polls: u32,
    /// Wall-clock deadline when waiting for a human decision.
    pub approval_timeout: Duration,
    /// Bound on concurrent twin invocations; `None` for unlimited.
    pub tool_concurrency_limit: Option<usize>,
    /// Bound on concurrent model calls; `None` for unlimited.
    pub llm_concurrency_limit: Option<usize>,
    /// Conversation turns kept; oldest are dropped beyond this.
    pub history_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            capability_top_k: 12,
            job_poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(300),
            job_http_fallback_polls: 5,
            approval_timeout: Duration::from_secs(3600),
            tool_concurrency_limit: None,
            llm_concurrency_limit: None,
            history_limit: 64,
        }
    }
}

/// Request/response state machine with a bounded conversation history.
pub struct Orchestrator {
    llm: Arc<dyn LmClient>,
    shadow: Arc<ShadowManager>,
    twin: Arc<TwinClient>,
    safety: Arc<SafetyKernel>,
    capabilities: Arc<PriorityIndex>,
    pub(crate) config: OrchestratorConfig,
    history: Mutex<Vec<ChatMessage>>,
    tool_semaphore: Option<Semaphore>,
    llm_semaphore: Option<Semaphore>,
}

impl Orchestrator {
    /// Compose the orchestrator.
    #[must_use]
    pub fn new(
        llm: Arc<dyn LmClient>,
        shadow: Arc<ShadowManager>,
        twin: Arc<TwinClient>,
        safety: Arc<SafetyKernel>,
        capabilities: Arc<PriorityIndex>,
        config: OrchestratorConfig,
    ) -> Self {
        let tool_semaphore = config.tool_concurrency_limit.map(Semaphore::new);
        let llm_semaphore = config.llm_concurrency_limit.map(Semaphore::new);
        Self {
            llm,
            shadow,
            twin,
            safety,
            capabilities,
            config,
            history: Mutex::new(Vec::new()),
            tool_semaphore,
            llm_semaphore,
        }
    }

    pub(crate) fn twin(&self) -> &Arc<TwinClient> {
        &self.twin
    }

    pub(crate) fn shadow(&self) -> &Arc<ShadowManager> {
        &self.shadow
    }

    pub(crate) fn safety(&self) -> &Arc<SafetyKernel> {
        &self.safety
    }

    /// Clear the conversation history.
    pub async fn reset_conversation(&self) {
        self.history.lock().await.clear();
    }

    async fn push_history(&self, message: ChatMessage) {
        let mut history = self.history.lock().await;
        if history.len() >= self.config.history_limit {
            history.remove(0);
        }
        history.push(message);
    }

    async fn acquire<'a>(semaphore: &'a Option<Semaphore>) -> Option<SemaphorePermit<'a>> {
        match semaphore {
            Some(semaphore) => semaphore.acquire().await.ok(),
            None => None,
        }
    }

    /// Process one user message through the full agent loop.
    ///
    /// # Errors
    ///
    /// Only request-level faults (model unavailable with no fallback); every
    /// per-call fault is reported inside the returned tool results.
    pub async fn process_message(
        &self,
        user_message: &str,
        roles: &[String],
        ctx: &AuditContext,
    ) -> Result<AgentReply, OrchestratorError> {
        info!(roles = ?roles, "processing message");
        self.push_history(ChatMessage::user(user_message)).await;

        let hits = self
            .capabilities
            .search(user_message, self.config.capability_top_k);
        let descriptors: Vec<ToolDescriptor> = hits
            .iter()
            .map(|hit| ToolDescriptor {
                name: hit.tool.name.clone(),
                description: hit.tool.description.clone(),
                input_schema: hit.tool.input_schema.clone(),
            })
            .collect();
        debug!(count = descriptors.len(), "retrieved tools");

        let response = {
            let _permit = Self::acquire(&self.llm_semaphore).await;
            let history = self.history.lock().await.clone();
            self.llm
                .chat(&history, &descriptors, Some(SYSTEM_PROMPT))
                .await?
        };

        if response.tool_calls.is_empty() {
            let content = response.content.unwrap_or_default();
            self.push_history(ChatMessage::assistant(content.clone())).await;
            return Ok(AgentReply::text(content));
        }

        let mut tool_results = Vec::new();
        for call in &response.tool_calls {
            let result = self
                .execute_tool(&call.name, call.arguments.clone(), roles, ctx)
                .await;
            tool_results.push(result);
        }

        let reply = build_reply(response.content.as_deref(), &tool_results);
        self.push_history(ChatMessage::assistant(reply.clone())).await;
        Ok(AgentReply::with_results(reply, tool_results))
    }

    /// Run one tool call through the safety-governed pipeline.
    pub async fn execute_tool(
        &self,
        tool_name: &str,
        mut params: Map<String, Value>,
        roles: &[String],
        ctx: &AuditContext,
    ) -> ToolResult {
        // Fresh idempotency key per call, never per intent.
        let action_id = Uuid::new_v4().to_string();
        debug!(tool = tool_name, action_id = %action_id, "starting tool execution");

        let Some(tool) = self.capabilities.get_by_name(tool_name).cloned() else {
            return ToolResult::error(
                tool_name,
                Some(action_id),
                format!("Unknown tool: {tool_name}"),
            );
        };

        if let Err(message) = validate_arguments(&tool, &params) {
            self.safety()
                .log_error(tool_name, roles, &message, Some(&action_id), ctx);
            return ToolResult::error(tool_name, Some(action_id), message);
        }

        let shadow_freshness = self.shadow.freshness_seconds().await;
        let request = EvaluationRequest {
            tool_name: tool_name.to_string(),
            risk: tool.risk,
            roles: roles.to_vec(),
            params: params.clone(),
            action_id: Some(action_id.clone()),
            shadow_freshness: Some(shadow_freshness),
        };
        let decision = self.safety.evaluate(&request, ctx).await;

        if !decision.allowed {
            return ToolResult {
                tool: tool_name.to_string(),
                success: false,
                result: None,
                error: decision.reason,
                simulated: false,
                job_id: None,
                task_id: None,
                status: ToolStatus::Denied,
                action_id: Some(action_id),
            };
        }

        let requested_simulation = params
            .get("simulate")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        // Approval gates a real execution before anything reaches the twin;
        // an explicitly requested simulation may still run first.
        if decision.require_approval && !requested_simulation {
            match self.safety.create_approval_task(&request, None, ctx).await {
                Ok(task_id) => {
                    return ToolResult {
                        tool: tool_name.to_string(),
                        success: true,
                        result: Some(json!({"message": "Awaiting human approval"})),
                        error: None,
                        simulated: false,
                        job_id: None,
                        task_id: Some(task_id),
                        status: ToolStatus::PendingApproval,
                        action_id: Some(action_id),
                    };
                }
                Err(err) => {
                    self.safety
                        .log_error(tool_name, roles, &err.to_string(), Some(&action_id), ctx);
                    return ToolResult::error(tool_name, Some(action_id), err.to_string());
                }
            }
        }

        if decision.force_simulation && !requested_simulation {
            info!(tool = tool_name, risk = %tool.risk, "forcing simulation");
            params.insert("simulate".into(), Value::Bool(true));
        }
        let simulated = params
            .get("simulate")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let invocation = {
            let _permit = Self::acquire(&self.tool_semaphore).await;
            self.invoke_operation(&tool, &params).await
        };
        let result = match invocation {
            Ok(result) => result,
            Err(err) => {
                self.safety
                    .log_error(tool_name, roles, &err.to_string(), Some(&action_id), ctx);
                return ToolResult::error(tool_name, Some(action_id), err.to_string());
            }
        };

        self.safety.log_execution(
            tool_name,
            tool.risk,
            roles,
            &result,
            simulated,
            Some(&action_id),
            ctx,
        );

        if simulated {
            return ToolResult {
                tool: tool_name.to_string(),
                success: true,
                result: Some(result),
                error: None,
                simulated: true,
                job_id: None,
                task_id: None,
                status: ToolStatus::SimulatedOnly,
                action_id: Some(action_id),
            };
        }

        let job_id = result
            .get("jobId")
            .or_else(|| result.get("job_id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(job_id) = job_id {
            let final_result = self
                .monitor_job(&job_id, &tool.submodel_id, &tool.operation_path, ctx)
                .await;
            let success = final_result
                .get("status")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<JobState>().ok())
                .is_some_and(|s| s.is_success());
            return ToolResult {
                tool: tool_name.to_string(),
                success,
                result: Some(final_result),
                error: None,
                simulated: false,
                job_id: Some(job_id),
                task_id: None,
                status: ToolStatus::Completed,
                action_id: Some(action_id),
            };
        }

        ToolResult {
            tool: tool_name.to_string(),
            success: true,
            result: Some(result),
            error: None,
            simulated: false,
            job_id: None,
            task_id: None,
            status: ToolStatus::Completed,
            action_id: Some(action_id),
        }
    }

    /// Invoke the twin, via the delegation URL when the operation has one.
    pub(crate) async fn invoke_operation(
        &self,
        tool: &ToolSpec,
        params: &Map<String, Value>,
    ) -> Result<Value, TwinError> {
        let input_arguments: Vec<Value> = params
            .iter()
            .filter(|(key, _)| key.as_str() != "simulate" && key.as_str() != "safety_reasoning")
            .map(|(key, value)| json!({"idShort": key, "value": value}))
            .collect();
        let simulate = params
            .get("simulate")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        match &tool.delegation_url {
            Some(url) => {
                self.twin
                    .invoke_delegated_operation(url, input_arguments, simulate)
                    .await
            }
            None => {
                self.twin
                    .invoke_operation(
                        &tool.submodel_id,
                        &tool.operation_path,
                        input_arguments,
                        Some(json!({"simulate": simulate})),
                        true,
                    )
                    .await
            }
        }
    }

    /// Block until a held task is decided, then report the outcome.
    ///
    /// Uses the configured approval timeout; the task itself is executed
    /// separately through [`Orchestrator::execute_approved_task`].
    pub async fn wait_for_approval(&self, task_id: &str, ctx: &AuditContext) -> AgentReply {
        match self
            .safety
            .wait_for_approval(task_id, self.config.approval_timeout, ctx)
            .await
        {
            Ok((true, _)) => {
                AgentReply::text(format!("Task {task_id} was approved. Operation can proceed."))
            }
            Ok((false, reason)) => {
                AgentReply::text(format!("Task {task_id} was not approved: {reason}"))
            }
            Err(err) => AgentReply::text(format!("Task {task_id} wait failed: {err}")),
        }
    }

    /// Execute a previously approved task without re-running approval.
    ///
    /// The caller's roles must include one of the original requester's roles
    /// or a privileged role.
    pub async fn execute_approved_task(
        &self,
        task_id: &str,
        roles: &[String],
        ctx: &AuditContext,
    ) -> AgentReply {
        let task = match self.safety.get_task(task_id, ctx).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                return AgentReply {
                    reply: Some(format!("Task {task_id} not found.")),
                    tool_results: vec![ToolResult::error(
                        "execute_task",
                        None,
                        format!("Task {task_id} not found"),
                    )],
                    pending_approval: false,
                    task_id: None,
                };
            }
            Err(err) => {
                return AgentReply {
                    reply: Some(format!("Task {task_id} could not be read: {err}")),
                    tool_results: vec![ToolResult::error("execute_task", None, err.to_string())],
                    pending_approval: false,
                    task_id: None,
                };
            }
        };

        if task.status != TaskStatus::Approved {
            let status = format!("{:?}", task.status);
            return AgentReply {
                reply: Some(format!("Task {task_id} cannot be executed. Status: {status}")),
                tool_results: vec![ToolResult::error(
                    "execute_task",
                    None,
                    format!("Task status is {status}, expected Approved"),
                )],
                pending_approval: false,
                task_id: None,
            };
        }

        let Some(tool) = self.capabilities.get_by_name(&task.tool).cloned() else {
            return AgentReply {
                reply: Some(format!("Tool '{}' from task {task_id} not found.", task.tool)),
                tool_results: vec![ToolResult::error(
                    &task.tool,
                    None,
                    format!("Tool not found: {}", task.tool),
                )],
                pending_approval: false,
                task_id: None,
            };
        };

        if !may_execute_for(&task.requested_by_roles, roles) {
            return AgentReply {
                reply: Some(format!("Roles {roles:?} not authorized to execute task {task_id}.")),
                tool_results: vec![ToolResult::error(
                    &task.tool,
                    None,
                    format!("Unauthorized: roles {roles:?}"),
                )],
                pending_approval: false,
                task_id: None,
            };
        }

        info!(task_id, tool = %task.tool, roles = ?roles, "executing approved task");
        let action_id = Uuid::new_v4().to_string();
        let params = task.args.clone();

        let result = match self.invoke_operation(&tool, &params).await {
            Ok(result) => result,
            Err(err) => {
                self.safety
                    .log_error(&task.tool, roles, &err.to_string(), Some(&action_id), ctx);
                return AgentReply {
                    reply: Some(format!("Task {task_id} execution failed: {err}")),
                    tool_results: vec![ToolResult::error(
                        &task.tool,
                        Some(action_id),
                        err.to_string(),
                    )],
                    pending_approval: false,
                    task_id: None,
                };
            }
        };

        self.safety.log_execution(
            &task.tool,
            tool.risk,
            roles,
            &result,
            false,
            Some(&action_id),
            ctx,
        );

        let job_id = result
            .get("jobId")
            .or_else(|| result.get("job_id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let tool_result = if let Some(job_id) = job_id {
            let final_result = self
                .monitor_job(&job_id, &tool.submodel_id, &tool.operation_path, ctx)
                .await;
            let success = final_result
                .get("status")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<JobState>().ok())
                .is_some_and(|s| s.is_success());
            ToolResult {
                tool: task.tool.clone(),
                success,
                result: Some(final_result),
                error: None,
                simulated: false,
                job_id: Some(job_id),
                task_id: None,
                status: ToolStatus::Completed,
                action_id: Some(action_id),
            }
        } else {
            ToolResult {
                tool: task.tool.clone(),
                success: true,
                result: Some(result),
                error: None,
                simulated: false,
                job_id: None,
                task_id: None,
                status: ToolStatus::Completed,
                action_id: Some(action_id),
            }
        };

        AgentReply {
            reply: Some(format!("Task {task_id} executed successfully.")),
            tool_results: vec![tool_result],
            pending_approval: false,
            task_id: None,
        }
    }
}

/// Validate proposed arguments against the tool's generated input schema.
fn validate_arguments(tool: &ToolSpec, params: &Map<String, Value>) -> Result<(), String> {
    let validator = jsonschema::validator_for(&tool.input_schema)
        .map_err(|e| format!("tool schema invalid: {e}"))?;
    let instance = Value::Object(params.clone());
    let mut failures: Vec<String> = validator
        .iter_errors(&instance)
        .map(|e| e.to_string())
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        failures.truncate(3);
        Err(format!("invalid arguments: {}", failures.join("; ")))
    }
}

/// Whether `current` roles may execute a task requested by `original` roles.
fn may_execute_for(original: &[String], current: &[String]) -> bool {
    if current
        .iter()
        .any(|role| PRIVILEGED_ROLES.contains(&role.as_str()))
    {
        return true;
    }
    current.iter().any(|role| original.contains(role))
}

/// Compose the natural-language reply from the model text and call results.
fn build_reply(llm_content: Option<&str>, results: &[ToolResult]) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(content) = llm_content
        && !content.is_empty()
    {
        parts.push(content.to_string());
    }
    for result in results {
        let part = match result.status {
            ToolStatus::SimulatedOnly => format!(
                "Simulation completed for '{}'. To execute for real, re-issue the command with \
                 simulate=false.",
                result.tool
            ),
            ToolStatus::PendingApproval => format!(
                "Operation '{}' requires human approval. Task ID: {}",
                result.tool,
                result.task_id.as_deref().unwrap_or("unknown")
            ),
            _ if result.success => format!("Executed '{}' successfully.", result.tool),
            _ => format!(
                "Failed to execute '{}': {}",
                result.tool,
                result.error.as_deref().unwrap_or("unknown error")
            ),
        };
        parts.push(part);
    }
    if parts.is_empty() {
        warn!("no reply parts produced");
        "No response generated.".to_string()
    } else {
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(status: ToolStatus, success: bool) -> ToolResult {
        ToolResult {
            tool: "SetSpeed".into(),
            success,
            result: None,
            error: (!success).then(|| "boom".to_string()),
            simulated: status == ToolStatus::SimulatedOnly,
            job_id: None,
            task_id: (status == ToolStatus::PendingApproval).then(|| "task-1".to_string()),
            status,
            action_id: Some("a".into()),
        }
    }

    #[test]
    fn reply_templates_cover_every_outcome() {
        let reply = build_reply(
            Some("On it."),
            &[
                result_with(ToolStatus::Completed, true),
                result_with(ToolStatus::SimulatedOnly, true),
                result_with(ToolStatus::PendingApproval, true),
                result_with(ToolStatus::Error, false),
            ],
        );
        assert!(reply.starts_with("On it."));
        assert!(reply.contains("Executed 'SetSpeed' successfully."));
        assert!(reply.contains("re-issue the command with simulate=false"));
        assert!(reply.contains("Task ID: task-1"));
        assert!(reply.contains("Failed to execute 'SetSpeed': boom"));
    }

    #[test]
    fn empty_reply_falls_back() {
        assert_eq!(build_reply(None, &[]), "No response generated.");
    }

    #[test]
    fn privileged_roles_may_execute_any_task() {
        let original = vec!["operator".to_string()];
        assert!(may_execute_for(&original, &["admin".to_string()]));
        assert!(may_execute_for(&original, &["maintenance".to_string()]));
        assert!(may_execute_for(&original, &["supervisor".to_string()]));
        assert!(may_execute_for(&original, &["operator".to_string()]));
        assert!(!may_execute_for(&original, &["viewer".to_string()]));
    }
}
