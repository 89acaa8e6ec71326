// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared data model for the Twinward execution core.
//!
//! This crate holds the JSON shapes every other crate speaks: the Asset
//! Administration Shell subset the agent consumes (shells, submodels, the
//! `modelType`-tagged element sum type, qualifiers), the ordered risk levels,
//! the Base64URL identifier codec used in URLs and bus topics, and the
//! approval-task and async-job records.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod aas;
pub mod ids;
pub mod job;
pub mod risk;
pub mod task;

pub use aas::{
    DiscoveredOperation, ElementCollection, ElementList, LangString, Operation,
    OperationVariable, Property, Qualifier, RefKey, Shell, Submodel, SubmodelElement, SubmodelRef,
    TwinSnapshot, collect_operations, find_element, property_value, qualifier_raw,
    qualifier_string, replace_element,
};
pub use ids::{IdCodecError, b64url_decode, b64url_encode};
pub use job::{JobBoard, JobRecord, JobState};
pub use risk::RiskLevel;
pub use task::{ApprovalTask, TaskList, TaskStatus};
