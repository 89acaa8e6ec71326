// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resilience primitives shared by the outbound clients.
//!
//! The [`CircuitBreaker`] gates any call whose backend can fail transiently
//! (the twin REST transport and the language-model client both wrap one);
//! [`ExponentialBackoff`] paces the event-bus reconnect loop.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod breaker;

pub use backoff::ExponentialBackoff;
pub use breaker::{BreakerConfig, BreakerOpen, BreakerStats, CircuitBreaker, CircuitState};
