// SPDX-License-Identifier: MIT OR Apache-2.0

//! Operation risk levels.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ordered risk classification attached to every twin operation.
///
/// The ordering `LOW < MEDIUM < HIGH < CRITICAL` is the single knob the
/// safety kernel uses to force simulation and require human approval.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    /// Safe for routine use.
    #[default]
    Low,
    /// May affect process state.
    Medium,
    /// Actuates equipment; simulation recommended.
    High,
    /// Safety-critical; requires human approval.
    Critical,
}

impl RiskLevel {
    /// Stable uppercase string form, matching the `RiskLevel` qualifier values.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognised risk level string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown risk level: {0}")]
pub struct UnknownRiskLevel(pub String);

impl FromStr for RiskLevel {
    type Err = UnknownRiskLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(UnknownRiskLevel(other.to_string())),
        }
    }
}
