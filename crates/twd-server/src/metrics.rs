// SPDX-License-Identifier: MIT OR Apache-2.0

//! Counter-level metrics, rendered as a plain text exposition.
//!
//! Only the signals are defined here; scraping and storage belong to the
//! deployment.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use twd_orchestrator::{ToolResult, ToolStatus};

/// Process-wide counters.
#[derive(Debug, Default)]
pub struct Metrics {
    requests_total: AtomicU64,
    chat_requests_total: AtomicU64,
    rate_limited_total: AtomicU64,
    tool_results: Mutex<BTreeMap<&'static str, u64>>,
    job_results: Mutex<BTreeMap<String, u64>>,
}

fn status_label(status: ToolStatus) -> &'static str {
    match status {
        ToolStatus::Completed => "completed",
        ToolStatus::Denied => "denied",
        ToolStatus::SimulatedOnly => "simulated_only",
        ToolStatus::PendingApproval => "pending_approval",
        ToolStatus::Error => "error",
    }
}

impl Metrics {
    /// Count one HTTP request.
    pub fn inc_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one chat request.
    pub fn inc_chat(&self) {
        self.chat_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one rate-limited rejection.
    pub fn inc_rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record tool-call outcomes and terminal job states.
    pub fn record_tool_results(&self, results: &[ToolResult]) {
        let mut by_status = self.tool_results.lock().unwrap_or_else(|e| e.into_inner());
        for result in results {
            *by_status.entry(status_label(result.status)).or_default() += 1;
        }
        drop(by_status);

        let mut jobs = self.job_results.lock().unwrap_or_else(|e| e.into_inner());
        for result in results {
            if result.job_id.is_some()
                && let Some(status) = result
                    .result
                    .as_ref()
                    .and_then(|r| r.get("status"))
                    .and_then(|s| s.as_str())
            {
                *jobs.entry(status.to_string()).or_default() += 1;
            }
        }
    }

    /// Render the counter section of the exposition.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "twinward_requests_total {}\n",
            self.requests_total.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "twinward_chat_requests_total {}\n",
            self.chat_requests_total.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "twinward_rate_limited_total {}\n",
            self.rate_limited_total.load(Ordering::Relaxed)
        ));
        for (status, count) in self.tool_results.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            out.push_str(&format!(
                "twinward_tool_results_total{{status=\"{status}\"}} {count}\n"
            ));
        }
        for (status, count) in self.job_results.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            out.push_str(&format!(
                "twinward_job_results_total{{status=\"{status}\"}} {count}\n"
            ));
        }
        out
    }
}
