// SPDX-License-Identifier: MIT OR Apache-2.0

//! Human-approval task records.
//!
//! The canonical task list lives inside a designated twin property as one
//! JSON blob; these types are its wire shape.

use crate::risk::RiskLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle state of an approval task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Awaiting a human decision.
    PendingApproval,
    /// Approved by an operator; eligible for execution.
    Approved,
    /// Rejected by an operator.
    Rejected,
    /// No longer present in the store.
    Expired,
}

impl TaskStatus {
    /// Whether the task has reached a final state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::PendingApproval)
    }
}

/// A human-in-the-loop approval task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalTask {
    /// Unique task identifier.
    pub task_id: String,
    /// Operation name the task gates.
    pub tool: String,
    /// Risk level of the operation.
    pub risk: RiskLevel,
    /// Roles that requested the operation.
    pub requested_by_roles: Vec<String>,
    /// Sanitized call arguments (safety fields stripped).
    #[serde(default)]
    pub args: Map<String, Value>,
    /// The caller's stated safety justification.
    #[serde(default)]
    pub safety_reasoning: String,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Idempotency key of the originating tool call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    /// Result of the preceding simulation run, if one was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulate_result: Option<Value>,
    /// Approver identity, stamped on approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    /// Approval timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    /// Rejector identity, stamped on rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_by: Option<String>,
    /// Rejection timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
    /// Operator-supplied rejection reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

/// The `{"tasks": [...]}` wrapper persisted in the twin property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskList {
    /// All tasks, in creation order.
    #[serde(default)]
    pub tasks: Vec<ApprovalTask>,
}
