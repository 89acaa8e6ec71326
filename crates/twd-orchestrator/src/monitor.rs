// SPDX-License-Identifier: MIT OR Apache-2.0

//! Async job monitor: shadow polling with HTTP fallback.

use crate::pipeline::Orchestrator;
use serde_json::{Value, json};
use std::time::Instant;
use tracing::{info, warn};
use twd_audit::AuditContext;
use twd_types::{JobBoard, JobState};

impl Orchestrator {
    /// Poll the shadow's job-status property until the job is terminal.
    ///
    /// Consecutive polls whose materialized job-list payload is identical to
    /// the previous one count as stale; after the configured number, one
    /// direct HTTP status check runs and the counter resets. Times out with
    /// `status=TIMEOUT` at the configured deadline.
    pub(crate) async fn monitor_job(
        &self,
        job_id: &str,
        submodel_id: &str,
        operation_path: &str,
        ctx: &AuditContext,
    ) -> Value {
        let policy = match self.safety().load_policy(false, ctx).await {
            Ok(policy) => policy,
            Err(err) => {
                warn!(job_id, error = %err, "policy unavailable for job monitoring");
                return json!({"job_id": job_id, "status": "TIMEOUT"});
            }
        };

        let started = Instant::now();
        let mut stale_polls: u32 = 0;
        let mut last_payload: Option<String> = None;

        while started.elapsed() < self.config.job_timeout {
            let board_value = self
                .shadow()
                .get_property_value(
                    &policy.job_status_submodel_id,
                    &policy.job_status_property_path,
                )
                .await;

            match board_value.as_ref().and_then(materialize_board) {
                Some((canonical, board)) => {
                    if last_payload.as_deref() == Some(canonical.as_str()) {
                        stale_polls += 1;
                    } else {
                        stale_polls = 0;
                        last_payload = Some(canonical);
                    }
                    if let Some(record) = board.find(job_id)
                        && record.state().is_some_and(is_shadow_terminal)
                    {
                        return serde_json::to_value(record).unwrap_or_default();
                    }
                }
                None => stale_polls += 1,
            }

            if stale_polls >= self.config.job_http_fallback_polls {
                info!(job_id, stale_polls, "shadow stale, falling back to HTTP job polling");
                match self
                    .twin()
                    .get_job_status(submodel_id, operation_path, job_id)
                    .await
                {
                    Ok(status) => {
                        let state = status
                            .get("status")
                            .or_else(|| status.get("executionState"))
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        if state.parse::<JobState>().is_ok_and(|s| s.is_terminal()) {
                            let result = status
                                .get("outputArguments")
                                .or_else(|| status.get("result"))
                                .cloned();
                            return json!({
                                "job_id": job_id,
                                "status": state,
                                "result": result,
                                "source": "http_fallback",
                            });
                        }
                    }
                    Err(err) => {
                        warn!(job_id, error = %err, "HTTP job polling failed");
                    }
                }
                // Back off the fallback path so a dead twin is not hammered.
                stale_polls = 0;
            }

            tokio::time::sleep(self.config.job_poll_interval).await;
        }

        json!({"job_id": job_id, "status": "TIMEOUT"})
    }
}

/// Terminal states the shadow-replicated board may report. `FINISHED` is an
/// HTTP-side synonym for `COMPLETED` and is only accepted from the `$result`
/// fallback, never from the shadow.
fn is_shadow_terminal(state: JobState) -> bool {
    matches!(
        state,
        JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::Timeout
    )
}

/// Decode the job-status property into its canonical form and board.
///
/// The property may hold the board directly or as a JSON-encoded string.
fn materialize_board(value: &Value) -> Option<(String, JobBoard)> {
    let board_value: Value = match value {
        Value::String(raw) => serde_json::from_str(raw).ok()?,
        other => other.clone(),
    };
    let board: JobBoard = serde_json::from_value(board_value.clone()).ok()?;
    // serde_json maps are sorted, so this rendering is canonical.
    let canonical = serde_json::to_string(&board_value).ok()?;
    Some((canonical, board))
}
