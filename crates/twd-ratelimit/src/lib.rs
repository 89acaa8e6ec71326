// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-client token-bucket admission control.
//!
//! Each client id owns a bucket refilled at a sustained rate with a burst
//! capacity. Buckets idle longer than the cleanup interval are evicted on
//! demand so an open endpoint cannot grow memory without bound.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// A single token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    /// Create a full bucket refilled at `rate` tokens/second up to `capacity`.
    #[must_use]
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            rate,
            capacity,
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_update = now;
    }

    /// Try to take `tokens` from the bucket.
    pub fn consume(&mut self, tokens: f64) -> bool {
        self.refill();
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    /// Tokens currently available.
    pub fn tokens_available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    /// Time until `tokens` become available (`deficit / rate`).
    pub fn time_until_available(&mut self, tokens: f64) -> Duration {
        self.refill();
        if self.tokens >= tokens {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((tokens - self.tokens) / self.rate)
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_update)
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// How long the client should wait before retrying, when denied.
    pub retry_after: Duration,
}

/// Per-client rate limiter.
///
/// Client ids are expected to be `"key:<api-key>"` when an API key header is
/// present and `"ip:<remote-addr>"` otherwise — see [`client_key`].
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    cleanup_interval: Duration,
    inner: Mutex<LimiterInner>,
}

#[derive(Debug)]
struct LimiterInner {
    buckets: HashMap<String, TokenBucket>,
    last_cleanup: Instant,
}

impl RateLimiter {
    /// Create a limiter for a sustained requests-per-minute rate.
    ///
    /// `burst_size` defaults to twice the per-second rate when `None`.
    #[must_use]
    pub fn new(requests_per_minute: f64, burst_size: Option<f64>) -> Self {
        let rate = requests_per_minute / 60.0;
        Self {
            rate,
            capacity: burst_size.unwrap_or(rate * 2.0),
            cleanup_interval: Duration::from_secs(300),
            inner: Mutex::new(LimiterInner {
                buckets: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cleanup_stale(&self, inner: &mut LimiterInner) {
        let now = Instant::now();
        if now.duration_since(inner.last_cleanup) < self.cleanup_interval {
            return;
        }
        let before = inner.buckets.len();
        let interval = self.cleanup_interval;
        inner.buckets.retain(|_, b| b.idle_for(now) <= interval);
        inner.last_cleanup = now;
        let evicted = before - inner.buckets.len();
        if evicted > 0 {
            debug!(count = evicted, "evicted idle rate-limit buckets");
        }
    }

    /// Check whether a request from `client_id` is admitted.
    #[must_use]
    pub fn check(&self, client_id: &str) -> RateDecision {
        let mut inner = self.lock();
        self.cleanup_stale(&mut inner);
        let bucket = inner
            .buckets
            .entry(client_id.to_string())
            .or_insert_with(|| TokenBucket::new(self.rate, self.capacity));
        if bucket.consume(1.0) {
            RateDecision {
                allowed: true,
                retry_after: Duration::ZERO,
            }
        } else {
            RateDecision {
                allowed: false,
                retry_after: bucket.time_until_available(1.0),
            }
        }
    }

    /// Number of currently tracked client buckets.
    #[must_use]
    pub fn tracked_clients(&self) -> usize {
        self.lock().buckets.len()
    }
}

/// Derive a rate-limit client id from request identity material.
#[must_use]
pub fn client_key(api_key: Option<&str>, remote_addr: &str) -> String {
    match api_key {
        Some(key) if !key.is_empty() => format!("key:{key}"),
        _ => format!("ip:{remote_addr}"),
    }
}
