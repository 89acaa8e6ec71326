// SPDX-License-Identifier: MIT OR Apache-2.0

//! Primary/fallback model switching behind a circuit breaker.

use crate::types::{ChatMessage, ChatResponse, LmClient, LmError, ToolDescriptor};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};
use twd_resilience::CircuitBreaker;

/// Wraps a primary model client with a breaker and an optional fallback.
///
/// While the breaker is open, calls route to the fallback (usually the rules
/// planner) so the agent stays operable offline; once the breaker recovers,
/// traffic returns to the primary.
pub struct ResilientLmClient {
    primary: Arc<dyn LmClient>,
    fallback: Option<Arc<dyn LmClient>>,
    breaker: CircuitBreaker,
    using_fallback: AtomicBool,
}

impl ResilientLmClient {
    /// Compose the wrapper.
    #[must_use]
    pub fn new(
        primary: Arc<dyn LmClient>,
        fallback: Option<Arc<dyn LmClient>>,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            primary,
            fallback,
            breaker,
            using_fallback: AtomicBool::new(false),
        }
    }

    /// Whether the last call was served by the fallback.
    #[must_use]
    pub fn is_using_fallback(&self) -> bool {
        self.using_fallback.load(Ordering::Relaxed)
    }

    /// The breaker guarding the primary.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl LmClient for ResilientLmClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDescriptor],
        system: Option<&str>,
    ) -> Result<ChatResponse, LmError> {
        if let Err(open) = self.breaker.ensure_can_execute() {
            return match &self.fallback {
                Some(fallback) => {
                    self.using_fallback.store(true, Ordering::Relaxed);
                    fallback.chat(messages, tools, system).await
                }
                None => Err(open.into()),
            };
        }

        match self.primary.chat(messages, tools, system).await {
            Ok(response) => {
                self.breaker.record_success();
                if self.using_fallback.swap(false, Ordering::Relaxed) {
                    info!("primary model recovered, leaving fallback");
                }
                Ok(response)
            }
            Err(err) => {
                self.breaker.record_failure();
                if !self.breaker.can_execute()
                    && let Some(fallback) = &self.fallback
                {
                    warn!(error = %err, "primary model failed and breaker opened, switching to fallback");
                    self.using_fallback.store(true, Ordering::Relaxed);
                    return fallback.chat(messages, tools, system).await;
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use twd_resilience::{BreakerConfig, CircuitState};

    /// Scripted primary: fails the first `fail_first` calls, then succeeds.
    struct ScriptedClient {
        label: &'static str,
        fail_first: usize,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(label: &'static str, fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                label,
                fail_first,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LmClient for ScriptedClient {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDescriptor],
            _system: Option<&str>,
        ) -> Result<ChatResponse, LmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(LmError::Api {
                    status: 500,
                    message: "scripted failure".into(),
                });
            }
            Ok(ChatResponse {
                content: Some(format!("{} response", self.label)),
                tool_calls: Vec::new(),
                finish_reason: Some("stop".into()),
            })
        }
    }

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(recovery_ms),
            half_open_max_calls: 1,
        })
    }

    #[tokio::test]
    async fn healthy_primary_is_used() {
        let client = ResilientLmClient::new(
            ScriptedClient::new("primary", 0),
            Some(ScriptedClient::new("fallback", 0) as Arc<dyn LmClient>),
            breaker(3, 1_000),
        );
        let response = client.chat(&[ChatMessage::user("hi")], &[], None).await.unwrap();
        assert_eq!(response.content.as_deref(), Some("primary response"));
        assert!(!client.is_using_fallback());
    }

    #[tokio::test]
    async fn switches_to_fallback_when_breaker_opens() {
        let client = ResilientLmClient::new(
            ScriptedClient::new("primary", 10),
            Some(ScriptedClient::new("fallback", 0) as Arc<dyn LmClient>),
            breaker(2, 60_000),
        );
        let messages = [ChatMessage::user("hi")];

        // First failure: breaker still closed, the error surfaces.
        assert!(client.chat(&messages, &[], None).await.is_err());
        assert_eq!(client.breaker().state(), CircuitState::Closed);

        // Second failure opens the breaker and falls back transparently.
        let response = client.chat(&messages, &[], None).await.unwrap();
        assert_eq!(response.content.as_deref(), Some("fallback response"));
        assert_eq!(client.breaker().state(), CircuitState::Open);
        assert!(client.is_using_fallback());

        // Subsequent calls short-circuit straight to the fallback.
        let response = client.chat(&messages, &[], None).await.unwrap();
        assert_eq!(response.content.as_deref(), Some("fallback response"));
    }

    #[tokio::test]
    async fn raises_breaker_open_without_fallback() {
        let client = ResilientLmClient::new(
            ScriptedClient::new("primary", 10),
            None,
            breaker(1, 60_000),
        );
        let messages = [ChatMessage::user("hi")];
        assert!(client.chat(&messages, &[], None).await.is_err());
        let err = client.chat(&messages, &[], None).await.unwrap_err();
        assert!(matches!(err, LmError::BreakerOpen(_)));
    }

    #[tokio::test]
    async fn recovers_to_primary_after_cooldown() {
        let client = ResilientLmClient::new(
            ScriptedClient::new("primary", 1),
            Some(ScriptedClient::new("fallback", 0) as Arc<dyn LmClient>),
            breaker(1, 20),
        );
        let messages = [ChatMessage::user("hi")];

        // One failure opens the breaker; call is served by the fallback.
        let response = client.chat(&messages, &[], None).await.unwrap();
        assert_eq!(response.content.as_deref(), Some("fallback response"));
        assert!(client.is_using_fallback());

        // After the cooldown the half-open probe reaches a healed primary.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let response = client.chat(&messages, &[], None).await.unwrap();
        assert_eq!(response.content.as_deref(), Some("primary response"));
        assert!(!client.is_using_fallback());
    }

    #[tokio::test]
    async fn successes_keep_the_failure_count_at_zero() {
        let client = ResilientLmClient::new(
            ScriptedClient::new("primary", 0),
            None,
            breaker(3, 1_000),
        );
        for _ in 0..5 {
            client.chat(&[ChatMessage::user("hi")], &[], None).await.unwrap();
        }
        let stats = client.breaker().stats();
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 5);
    }
}
