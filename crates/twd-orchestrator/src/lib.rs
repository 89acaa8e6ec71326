// SPDX-License-Identifier: MIT OR Apache-2.0

//! The orchestrator: end-to-end request loop over the model, the capability
//! index, the safety kernel, the twin transport, and the async job monitor.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod monitor;
mod pipeline;

pub use pipeline::{
    AgentReply, Orchestrator, OrchestratorConfig, OrchestratorError, ToolResult, ToolStatus,
};
