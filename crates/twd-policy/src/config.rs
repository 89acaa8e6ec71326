// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsed policy configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use twd_types::RiskLevel;

/// Comparison operator of an interlock predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    /// Numeric `>`.
    #[serde(rename = ">")]
    Gt,
    /// Numeric `<`.
    #[serde(rename = "<")]
    Lt,
    /// Numeric `>=`.
    #[serde(rename = ">=")]
    Ge,
    /// Numeric `<=`.
    #[serde(rename = "<=")]
    Le,
    /// Stringified equality.
    #[serde(rename = "==")]
    Eq,
    /// Stringified inequality.
    #[serde(rename = "!=")]
    Ne,
}

/// The predicate of an interlock rule: deny every operation while it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenyWhen {
    /// Submodel holding the guarded property.
    pub submodel: String,
    /// idShort path of the guarded property.
    pub path: String,
    /// Comparison operator.
    pub op: CompareOp,
    /// Threshold value.
    pub value: Value,
}

/// One interlock rule; rules are evaluated in order, first violation wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterlockRule {
    /// Rule identifier, used in logs and audit entries.
    pub id: String,
    /// The predicate.
    pub deny_when: DenyWhen,
    /// Operator-facing message surfaced on violation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl InterlockRule {
    /// The denial message for this rule.
    #[must_use]
    pub fn denial_message(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| format!("Interlock {} violated", self.id))
    }
}

/// Operations a role may call; the literal `*` allows all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleBinding {
    /// Allowed operation names.
    #[serde(default)]
    pub allow: Vec<String>,
}

impl RoleBinding {
    /// Whether this binding allows the named tool.
    #[must_use]
    pub fn allows(&self, tool_name: &str) -> bool {
        self.allow.iter().any(|a| a == "*" || a == tool_name)
    }
}

/// Parsed policy configuration.
///
/// Unknown fields are ignored on load so a newer policy document does not
/// brick an older agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Risk at or above which simulation is forced first.
    pub require_simulation_for_risk: RiskLevel,
    /// Risk at or above which human approval is required.
    pub require_approval_for_risk: RiskLevel,
    /// Role name → allowed operations. Empty means permit all.
    pub role_bindings: BTreeMap<String, RoleBinding>,
    /// Ordered interlock rules.
    pub interlocks: Vec<InterlockRule>,
    /// Submodel holding the task store property.
    pub task_submodel_id: String,
    /// idShort path of the task store property.
    pub tasks_property_path: String,
    /// Submodel holding the job status property.
    pub job_status_submodel_id: String,
    /// idShort path of the job status property.
    pub job_status_property_path: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            require_simulation_for_risk: RiskLevel::High,
            require_approval_for_risk: RiskLevel::Critical,
            role_bindings: BTreeMap::new(),
            interlocks: Vec::new(),
            task_submodel_id: String::new(),
            tasks_property_path: "TasksJson".into(),
            job_status_submodel_id: String::new(),
            job_status_property_path: "JobStatusJson".into(),
        }
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn stringified(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Evaluate an interlock predicate against a current property value.
///
/// Numeric comparison for the ordering operators (unparseable operands never
/// violate), stringified equality for `==`/`!=`.
#[must_use]
pub fn violates(current: &Value, op: CompareOp, threshold: &Value) -> bool {
    let numeric = |cmp: fn(f64, f64) -> bool| match (as_f64(current), as_f64(threshold)) {
        (Some(current), Some(threshold)) => cmp(current, threshold),
        _ => false,
    };
    match op {
        CompareOp::Gt => numeric(|c, t| c > t),
        CompareOp::Lt => numeric(|c, t| c < t),
        CompareOp::Ge => numeric(|c, t| c >= t),
        CompareOp::Le => numeric(|c, t| c <= t),
        CompareOp::Eq => stringified(current) == stringified(threshold),
        CompareOp::Ne => stringified(current) != stringified(threshold),
    }
}
