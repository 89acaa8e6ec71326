// SPDX-License-Identifier: MIT OR Apache-2.0

//! Exponential backoff calculator for reconnect loops.

use std::time::Duration;

/// Exponential backoff: `delay_k = min(max_delay, base_delay * multiplier^k)`.
///
/// The attempt counter starts at zero for the first retry after a failure and
/// is reset on every successful connect.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a backoff with the default doubling multiplier.
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self::with_multiplier(base_delay, max_delay, 2.0)
    }

    /// Create a backoff with an explicit multiplier.
    #[must_use]
    pub fn with_multiplier(base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier,
            attempt: 0,
        }
    }

    /// Reset the attempt counter after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The delay for the next retry, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = self.multiplier.powi(self.attempt as i32);
        let scaled = self.base_delay.as_secs_f64() * factor;
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }

    /// Number of retries since the last reset.
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        self.attempt
    }
}
