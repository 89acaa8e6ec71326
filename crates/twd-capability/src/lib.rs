// SPDX-License-Identifier: MIT OR Apache-2.0

//! Capability layer: turns twin operations into LM-callable tool specs and
//! retrieves a small top-K candidate set for a free-form query.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod index;
mod schema;

pub use index::{CapabilityHit, CapabilityIndex, PriorityIndex};
pub use schema::{ToolSpec, build_input_schema, tool_spec_from, tool_specs};
