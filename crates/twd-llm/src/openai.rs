// SPDX-License-Identifier: MIT OR Apache-2.0

//! OpenAI-compatible chat-completions client.
//!
//! Covers any provider speaking the `/chat/completions` dialect, which is
//! how both hosted model options are deployed here.

use crate::types::{ChatMessage, ChatResponse, LmClient, LmError, ToolCall, ToolDescriptor};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::debug;

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API base URL, up to but excluding `/chat/completions`.
    pub base_url: String,
    /// Bearer token.
    pub api_key: String,
    /// Model identifier.
    pub model: String,
    /// Response token cap.
    pub max_tokens: u32,
    /// Client-side request timeout.
    pub timeout: Duration,
}

/// Chat client for OpenAI-compatible APIs.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiCompatClient {
    /// Build a client.
    ///
    /// # Errors
    ///
    /// Propagates [`reqwest`] builder failures.
    pub fn new(config: OpenAiConfig) -> Result<Self, LmError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { http, config })
    }

    fn request_body(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDescriptor],
        system: Option<&str>,
    ) -> Value {
        let mut wire_messages = Vec::new();
        if let Some(system) = system {
            wire_messages.push(json!({"role": "system", "content": system}));
        }
        for message in messages {
            wire_messages.push(serde_json::to_value(message).unwrap_or_default());
        }

        let mut body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "messages": wire_messages,
        });
        if !tools.is_empty() {
            let wire_tools: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(wire_tools);
        }
        body
    }
}

fn parse_tool_calls(message: &Value) -> Result<Vec<ToolCall>, LmError> {
    let Some(raw_calls) = message.get("tool_calls").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    let mut calls = Vec::new();
    for raw in raw_calls {
        let function = raw
            .get("function")
            .ok_or_else(|| LmError::Decode("tool call without function".into()))?;
        let name = function
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| LmError::Decode("tool call without name".into()))?;
        // Arguments arrive as a JSON-encoded string.
        let arguments: Map<String, Value> = match function.get("arguments") {
            Some(Value::String(s)) => serde_json::from_str(s)
                .map_err(|e| LmError::Decode(format!("tool arguments: {e}")))?,
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        calls.push(ToolCall {
            id: raw
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            name: name.to_string(),
            arguments,
        });
    }
    Ok(calls)
}

#[async_trait]
impl LmClient for OpenAiCompatClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDescriptor],
        system: Option<&str>,
    ) -> Result<ChatResponse, LmError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        debug!(model = %self.config.model, tools = tools.len(), "chat completion request");
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&self.request_body(messages, tools, system))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| LmError::Decode(e.to_string()))?;
        let choice = body
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| LmError::Decode("response without choices".into()))?;
        let message = choice
            .get("message")
            .ok_or_else(|| LmError::Decode("choice without message".into()))?;

        Ok(ChatResponse {
            content: message
                .get("content")
                .and_then(Value::as_str)
                .map(str::to_string),
            tool_calls: parse_tool_calls(message)?,
            finish_reason: choice
                .get("finish_reason")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}
