// SPDX-License-Identifier: MIT OR Apache-2.0

//! Async-job status records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

/// Lifecycle state of a server-side async job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    /// Accepted but not started.
    Initiated,
    /// In progress.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before completion.
    Cancelled,
    /// HTTP-side synonym for [`JobState::Completed`].
    Finished,
    /// Produced by the job monitor when the overall deadline passes.
    Timeout,
}

impl JobState {
    /// Whether the job will make no further progress.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Finished | Self::Timeout
        )
    }

    /// Whether the job ended successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Finished)
    }

    /// Stable uppercase string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "INITIATED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Finished => "FINISHED",
            Self::Timeout => "TIMEOUT",
        }
    }
}

/// Error returned when parsing an unrecognised job state string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job state: {0}")]
pub struct UnknownJobState(pub String);

impl FromStr for JobState {
    type Err = UnknownJobState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIATED" => Ok(Self::Initiated),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            "FINISHED" => Ok(Self::Finished),
            "TIMEOUT" => Ok(Self::Timeout),
            other => Err(UnknownJobState(other.to_string())),
        }
    }
}

/// One job entry as materialized in the job-status twin property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job identifier handed back by `$invoke-async`.
    pub job_id: String,
    /// Raw status string; parse with [`JobState::from_str`] to interpret.
    #[serde(default)]
    pub status: String,
    /// Job result, present once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Remaining fields, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobRecord {
    /// Parsed state, when the status string is recognised.
    #[must_use]
    pub fn state(&self) -> Option<JobState> {
        self.status.parse().ok()
    }
}

/// The `{"jobs": [...]}` wrapper persisted in the job-status twin property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobBoard {
    /// Known jobs.
    #[serde(default)]
    pub jobs: Vec<JobRecord>,
}

impl JobBoard {
    /// Look up a job by id.
    #[must_use]
    pub fn find(&self, job_id: &str) -> Option<&JobRecord> {
        self.jobs.iter().find(|j| j.job_id == job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_and_success_classification() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Finished.is_success());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Failed.is_success());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Initiated.is_terminal());
    }

    #[test]
    fn board_lookup() {
        let board: JobBoard = serde_json::from_value(json!({
            "jobs": [
                {"job_id": "job-1", "status": "RUNNING"},
                {"job_id": "job-2", "status": "COMPLETED", "result": {"ok": true}}
            ]
        }))
        .unwrap();
        assert_eq!(board.find("job-2").unwrap().state(), Some(JobState::Completed));
        assert!(board.find("job-9").is_none());
    }

    #[test]
    fn unknown_status_string_is_preserved() {
        let record: JobRecord =
            serde_json::from_value(json!({"job_id": "j", "status": "WEIRD"})).unwrap();
        assert_eq!(record.state(), None);
        assert_eq!(record.status, "WEIRD");
    }
}
