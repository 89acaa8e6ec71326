// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic rules-based planner.
//!
//! Serves as the offline default and as the fallback behind the resilient
//! wrapper. It is a real planner, not a mock: a normalized form of the
//! latest user message runs through an ordered list of specific command
//! patterns, then generic `set X to N` / `get X` / `call X` fallbacks with a
//! fuzzy tool-name resolver, and the produced calls carry the same mandatory
//! safety fields a hosted model would emit.

use crate::types::{ChatMessage, ChatResponse, LmClient, LmError, Role, ToolCall, ToolDescriptor};
use async_trait::async_trait;
use regex::{Captures, Regex};
use serde_json::{Map, Value, json};
use tracing::info;
use uuid::Uuid;

const POLITE_PREFIXES: &[&str] = &[
    "please ",
    "can you ",
    "could you ",
    "would you ",
    "kindly ",
];

fn no_args(_: &Captures<'_>) -> Map<String, Value> {
    Map::new()
}

fn numeric_arg(name: &'static str) -> impl Fn(&Captures<'_>) -> Map<String, Value> {
    move |captures: &Captures<'_>| {
        let mut args = Map::new();
        if let Some(value) = captures.get(1).and_then(|m| m.as_str().parse::<f64>().ok()) {
            args.insert(name.to_string(), json!(value));
        }
        args
    }
}

/// Pattern-matching planner over a normalized user message.
pub struct RulesPlanner {
    specific: Vec<(Regex, &'static str, Box<dyn Fn(&Captures<'_>) -> Map<String, Value> + Send + Sync>)>,
    set_pattern: Regex,
    get_pattern: Regex,
    call_pattern: Regex,
}

impl Default for RulesPlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl RulesPlanner {
    /// Build the planner with its pattern tables.
    ///
    /// All patterns are compiled from literals, so construction cannot fail.
    #[must_use]
    pub fn new() -> Self {
        info!("using rules-based planner (no model API key)");
        let spec = |re: &str| Regex::new(re).expect("pattern literals compile");
        let specific: Vec<(Regex, &'static str, Box<dyn Fn(&Captures<'_>) -> Map<String, Value> + Send + Sync>)> = vec![
            (
                spec(r"set\s+speed\s+(?:to\s+)?(-?\d+(?:\.\d+)?)"),
                "SetSpeed",
                Box::new(numeric_arg("RPM")),
            ),
            (spec(r"start\s+(?:the\s+)?pump"), "StartPump", Box::new(no_args)),
            (spec(r"stop\s+(?:the\s+)?pump"), "StopPump", Box::new(no_args)),
            (
                spec(r"set\s+temp(?:erature)?\s+(?:to\s+)?(-?\d+(?:\.\d+)?)"),
                "SetTemperature",
                Box::new(numeric_arg("Temperature")),
            ),
            (spec(r"(?:get|show|check)\s+status"), "GetStatus", Box::new(no_args)),
            (
                spec(r"(?:read|get|show)\s+temp(?:erature)?"),
                "ReadTemperature",
                Box::new(no_args),
            ),
            (spec(r"emergency\s+stop"), "EmergencyStop", Box::new(no_args)),
        ];
        Self {
            specific,
            set_pattern: spec(r"set\s+(?:the\s+)?([a-z][a-z0-9 _-]*?)\s+to\s+(-?\d+(?:\.\d+)?)"),
            get_pattern: spec(r"(?:get|read|show|check)\s+(?:the\s+)?([a-z][a-z0-9 _-]+)"),
            call_pattern: spec(r"(?:call|run|invoke|execute)\s+(?:the\s+)?([a-z][a-z0-9 _-]+)"),
        }
    }

    fn normalize(message: &str) -> String {
        let mut text = message.trim().to_lowercase();
        loop {
            let before = text.len();
            for prefix in POLITE_PREFIXES {
                if let Some(rest) = text.strip_prefix(prefix) {
                    text = rest.trim_start().to_string();
                }
            }
            if text.len() == before {
                break;
            }
        }
        text
    }

    fn wants_simulation(message: &str) -> bool {
        message.contains("simulate") && !message.contains("simulate=false")
    }

    fn make_call(
        tool: &ToolDescriptor,
        mut args: Map<String, Value>,
        simulate: bool,
    ) -> ToolCall {
        args.insert("simulate".into(), json!(simulate));
        args.insert(
            "safety_reasoning".into(),
            json!("Matched command pattern in user request"),
        );
        ToolCall {
            id: format!("call_{}", &Uuid::new_v4().simple().to_string()[..8]),
            name: tool.name.clone(),
            arguments: args,
        }
    }

    fn plan(&self, message: &str, tools: &[ToolDescriptor]) -> Option<ToolCall> {
        let simulate = Self::wants_simulation(message);

        for (pattern, tool_name, extractor) in &self.specific {
            if let Some(captures) = pattern.captures(message)
                && let Some(tool) = tools.iter().find(|t| t.name == *tool_name)
            {
                return Some(Self::make_call(tool, extractor(&captures), simulate));
            }
        }

        // Generic fallbacks with fuzzy tool resolution.
        if let Some(captures) = self.set_pattern.captures(message)
            && let Some(tool) = fuzzy_match(&format!("set {}", &captures[1]), tools)
        {
            let mut args = Map::new();
            if let (Some(argument), Ok(value)) = (
                tool.argument_names().first().copied(),
                captures[2].parse::<f64>(),
            ) {
                args.insert(argument.to_string(), json!(value));
            }
            return Some(Self::make_call(tool, args, simulate));
        }
        if let Some(captures) = self.get_pattern.captures(message)
            && let Some(tool) = fuzzy_match(&format!("get {}", &captures[1]), tools)
        {
            return Some(Self::make_call(tool, Map::new(), simulate));
        }
        if let Some(captures) = self.call_pattern.captures(message)
            && let Some(tool) = fuzzy_match(&captures[1], tools)
        {
            return Some(Self::make_call(tool, Map::new(), simulate));
        }
        None
    }
}

/// Split a CamelCase tool name into lowercase words.
fn name_words(name: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    for c in name.chars() {
        if c.is_uppercase() && !current.is_empty() {
            words.push(current.to_lowercase());
            current = String::new();
        }
        if c.is_alphanumeric() {
            current.push(c);
        } else if !current.is_empty() {
            words.push(current.to_lowercase());
            current = String::new();
        }
    }
    if !current.is_empty() {
        words.push(current.to_lowercase());
    }
    words
}

/// Resolve a free-form phrase to an available tool.
///
/// Tiers, in order: case-insensitive equality (spaces ignored), substring
/// containment, then maximum shared-word count.
fn fuzzy_match<'a>(phrase: &str, tools: &'a [ToolDescriptor]) -> Option<&'a ToolDescriptor> {
    let phrase_words: Vec<String> = phrase
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect();
    let compact = phrase_words.join("");

    // Tier 1: exact (ignoring case and separators).
    if let Some(tool) = tools
        .iter()
        .find(|t| t.name.to_lowercase() == compact || name_words(&t.name).join("") == compact)
    {
        return Some(tool);
    }

    // Tier 2: substring containment either way.
    if let Some(tool) = tools.iter().find(|t| {
        let name = name_words(&t.name).join("");
        !compact.is_empty() && (name.contains(&compact) || compact.contains(&name))
    }) {
        return Some(tool);
    }

    // Tier 3: most shared words wins, ties to the first tool.
    tools
        .iter()
        .map(|t| {
            let words = name_words(&t.name);
            let shared = phrase_words.iter().filter(|w| words.contains(w)).count();
            (t, shared)
        })
        .filter(|(_, shared)| *shared > 0)
        .max_by_key(|(_, shared)| *shared)
        .map(|(t, _)| t)
}

#[async_trait]
impl LmClient for RulesPlanner {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDescriptor],
        _system: Option<&str>,
    ) -> Result<ChatResponse, LmError> {
        let Some(user_message) = messages.iter().rev().find(|m| m.role == Role::User) else {
            return Ok(ChatResponse {
                content: Some("I didn't receive a message to process.".into()),
                tool_calls: Vec::new(),
                finish_reason: Some("stop".into()),
            });
        };
        let normalized = Self::normalize(&user_message.content);

        if let Some(call) = self.plan(&normalized, tools) {
            return Ok(ChatResponse {
                content: None,
                tool_calls: vec![call],
                finish_reason: Some("tool_use".into()),
            });
        }

        let available = if tools.is_empty() {
            "none loaded".to_string()
        } else {
            tools
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        Ok(ChatResponse {
            content: Some(format!(
                "I couldn't understand that command. Available operations: {available}. \
                 Try commands like 'start pump', 'set speed to 1200', or 'stop pump'."
            )),
            tool_calls: Vec::new(),
            finish_reason: Some("stop".into()),
        })
    }
}
