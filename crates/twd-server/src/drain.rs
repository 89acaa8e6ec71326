// SPDX-License-Identifier: MIT OR Apache-2.0

//! Graceful shutdown with in-flight request draining.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Tracks shutdown state and in-flight requests.
///
/// Once shutdown triggers, new chat and execute requests are refused with
/// 503 while in-flight ones drain, up to the configured window.
#[derive(Debug, Default)]
pub struct DrainState {
    shutting_down: AtomicBool,
    active: AtomicU64,
}

/// RAII guard for one in-flight request.
pub struct RequestGuard {
    drain: Arc<DrainState>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.drain.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl DrainState {
    /// Whether shutdown has been triggered.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Number of requests currently in flight.
    pub fn active_requests(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    /// Register an in-flight request; the guard releases it on drop.
    pub fn request_started(self: &Arc<Self>) -> RequestGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        RequestGuard {
            drain: Arc::clone(self),
        }
    }

    /// Start refusing new requests.
    pub fn trigger_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            info!("shutdown triggered, draining in-flight requests");
        }
    }

    /// Wait for in-flight requests to finish, up to `timeout`.
    pub async fn wait_for_drain(&self, timeout: Duration) {
        let started = Instant::now();
        while self.active_requests() > 0 {
            if started.elapsed() > timeout {
                warn!(
                    active = self.active_requests(),
                    "drain timeout reached, proceeding with shutdown"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("all in-flight requests drained");
    }
}
