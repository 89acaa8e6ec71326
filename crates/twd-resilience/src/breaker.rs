// SPDX-License-Identifier: MIT OR Apache-2.0

//! Three-state circuit breaker.

use serde::Serialize;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Backend considered down; calls short-circuit.
    Open,
    /// Probing whether the backend recovered.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Breaker tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Cooldown before an open circuit admits probe calls.
    pub recovery_timeout: Duration,
    /// Successful probes required to close again.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

/// Error raised when a call is attempted against an open circuit.
#[derive(Debug, thiserror::Error)]
#[error("circuit breaker is {state}, retry after {retry_after:?}")]
pub struct BreakerOpen {
    /// State observed at rejection time.
    pub state: CircuitState,
    /// The configured recovery timeout.
    pub retry_after: Duration,
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures recorded in the closed state.
    pub failure_count: u32,
    /// Total successes recorded.
    pub success_count: u64,
    /// Seconds since the last failure, if any.
    pub seconds_since_last_failure: Option<f64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    last_failure: Option<Instant>,
    half_open_calls: u32,
}

/// Three-state failure gate.
///
/// State transitions are driven by the caller reporting outcomes: the breaker
/// never retries on its own. Time-based promotion from `Open` to `HalfOpen`
/// happens the first time the state is read after the cooldown elapses.
///
/// HTTP semantics are the caller's concern: a 4xx is a client error and
/// should be recorded as success; only 5xx and transport errors count as
/// backend failures.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl CircuitBreaker {
    /// Create a breaker with the given tuning.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                half_open_calls: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only happens if a panic escaped while holding it;
        // the state is plain-old-data, so continue with whatever is there.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn promote_if_due(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open
            && let Some(last) = inner.last_failure
            && last.elapsed() > self.config.recovery_timeout
        {
            info!("circuit breaker transitioning to half-open");
            inner.state = CircuitState::HalfOpen;
            inner.half_open_calls = 0;
        }
    }

    /// Current state, applying the time-based half-open promotion.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.promote_if_due(&mut inner);
        inner.state
    }

    /// Whether a call may proceed right now.
    #[must_use]
    pub fn can_execute(&self) -> bool {
        let mut inner = self.lock();
        self.promote_if_due(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => inner.half_open_calls < self.config.half_open_max_calls,
            CircuitState::Open => false,
        }
    }

    /// Return an error unless a call may proceed.
    ///
    /// # Errors
    ///
    /// [`BreakerOpen`] when the circuit is open or the half-open probe budget
    /// is exhausted.
    pub fn ensure_can_execute(&self) -> Result<(), BreakerOpen> {
        if self.can_execute() {
            Ok(())
        } else {
            Err(BreakerOpen {
                state: self.state(),
                retry_after: self.config.recovery_timeout,
            })
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.success_count += 1;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_calls += 1;
                if inner.half_open_calls >= self.config.half_open_max_calls {
                    info!(
                        successful_calls = inner.half_open_calls,
                        "circuit breaker closing after recovery"
                    );
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                }
            }
            CircuitState::Closed => inner.failure_count = 0,
            // Success while open can only come from a call admitted before
            // the circuit tripped; the probe path goes through half-open.
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    ///
    /// A failure while open refreshes the failure timestamp, extending the
    /// cooldown so a burst of failures does not short-circuit recovery.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => {
                warn!("circuit breaker reopening after failure in half-open state");
                inner.state = CircuitState::Open;
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                warn!(
                    failure_count = inner.failure_count,
                    threshold = self.config.failure_threshold,
                    "circuit breaker opening"
                );
                inner.state = CircuitState::Open;
            }
            _ => {}
        }
    }

    /// Statistics snapshot for readiness probes and metrics.
    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.lock();
        self.promote_if_due(&mut inner);
        BreakerStats {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            seconds_since_last_failure: inner.last_failure.map(|t| t.elapsed().as_secs_f64()),
        }
    }
}
