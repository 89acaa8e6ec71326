// SPDX-License-Identifier: MIT OR Apache-2.0

//! Chat types and the client trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use twd_resilience::BreakerOpen;

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// System instructions.
    System,
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author of the turn.
    pub role: Role,
    /// Text content.
    pub content: String,
}

impl ChatMessage {
    /// Convenience constructor for a user turn.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Convenience constructor for an assistant turn.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A tool invocation proposed by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-scoped call id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Call arguments.
    pub arguments: Map<String, Value>,
}

/// A tool made available to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name.
    pub name: String,
    /// Human description.
    pub description: String,
    /// JSON Schema of the arguments.
    pub input_schema: Value,
}

impl ToolDescriptor {
    /// Argument property names, excluding the ambient safety fields.
    #[must_use]
    pub fn argument_names(&self) -> Vec<&str> {
        self.input_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .keys()
                    .map(String::as_str)
                    .filter(|k| *k != "simulate" && *k != "safety_reasoning")
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Model output: free text and/or tool calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    /// Assistant text, when any.
    pub content: Option<String>,
    /// Proposed tool calls, in order.
    pub tool_calls: Vec<ToolCall>,
    /// Provider finish reason.
    pub finish_reason: Option<String>,
}

/// Errors from model calls.
#[derive(Debug, thiserror::Error)]
pub enum LmError {
    /// The wrapping circuit breaker refused the call and no fallback exists.
    #[error(transparent)]
    BreakerOpen(#[from] BreakerOpen),
    /// Transport-level failure.
    #[error("model request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The provider answered with an error status.
    #[error("model API returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },
    /// The provider response could not be interpreted.
    #[error("model response decode failed: {0}")]
    Decode(String),
}

/// A chat-completion client.
#[async_trait]
pub trait LmClient: Send + Sync {
    /// Run one chat completion over the conversation.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDescriptor],
        system: Option<&str>,
    ) -> Result<ChatResponse, LmError>;
}
