// SPDX-License-Identifier: MIT OR Apache-2.0

//! Language-model clients for the orchestrator.
//!
//! [`LmClient`] is the seam: the orchestrator neither knows nor cares whether
//! it is talking to a hosted model, the deterministic [`RulesPlanner`], or a
//! [`ResilientLmClient`] switching between the two behind a circuit breaker.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod openai;
mod resilient;
mod rules;
mod types;

pub use openai::{OpenAiCompatClient, OpenAiConfig};
pub use resilient::ResilientLmClient;
pub use rules::RulesPlanner;
pub use types::{ChatMessage, ChatResponse, LmClient, LmError, Role, ToolCall, ToolDescriptor};
