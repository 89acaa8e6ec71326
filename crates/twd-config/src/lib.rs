// SPDX-License-Identifier: MIT OR Apache-2.0

//! Settings for the Twinward agent.
//!
//! Loaded once at startup from a TOML file, with environment-variable
//! overrides for secrets, then read-only for the life of the process. There
//! is no hot reload of settings; only the policy hot-reloads, through its
//! cache TTL and max-age.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Errors from configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },
    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },
}

/// Advisory issues that deserve an operator's attention but do not prevent
/// startup.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigWarning {
    /// Policy signature verification is switched off.
    PolicyVerificationDisabled,
    /// Interlocks will be skipped instead of denying when unevaluable.
    InterlockFailOpen,
    /// The API accepts caller-asserted roles without authentication.
    UnauthenticatedRoles,
    /// Rate limiting is configured unusually low or high.
    UnusualRateLimit {
        /// Configured requests per minute.
        rpm: f64,
    },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PolicyVerificationDisabled => {
                write!(f, "policy_verification_required is off; unsigned policies will be accepted")
            }
            Self::InterlockFailOpen => {
                write!(f, "interlock_fail_safe is off; unevaluable interlocks will be skipped")
            }
            Self::UnauthenticatedRoles => {
                write!(f, "auth_mode is 'none'; roles are taken from the X-Roles header unverified")
            }
            Self::UnusualRateLimit { rpm } => {
                write!(f, "rate limit of {rpm} requests/minute is outside the usual range")
            }
        }
    }
}

/// How API callers are identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Roles come from the `X-Roles` header, unauthenticated.
    None,
    /// Subject comes from the client certificate via a trusted proxy header
    /// and maps to roles through `subject_roles`.
    Mtls,
}

/// Which planner answers chat requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LmProvider {
    /// The deterministic rules planner; no API key needed.
    Rules,
    /// An OpenAI-compatible hosted model, with the rules planner as fallback.
    Openai,
}

/// Circuit breaker knobs, shared by the twin and model clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Seconds before an open circuit admits probes.
    pub recovery_timeout_secs: f64,
    /// Successful probes required to close.
    pub half_open_max_calls: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 30.0,
            half_open_max_calls: 3,
        }
    }
}

/// Twin repository connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwinSettings {
    /// Shell repository base URL.
    pub base_url: String,
    /// Submodel repository base URL, when hosted separately.
    pub submodel_base_url: Option<String>,
    /// Shell id to govern.
    pub aas_id: String,
    /// Repository id for shell-repository bus topics.
    pub aas_repo_id: String,
    /// Repository id for submodel-repository bus topics.
    pub submodel_repo_id: Option<String>,
    /// HTTP timeout in seconds.
    pub http_timeout_secs: f64,
    /// Breaker around the twin transport.
    pub breaker: BreakerSettings,
}

impl Default for TwinSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".into(),
            submodel_base_url: None,
            aas_id: "urn:example:aas:pump-001".into(),
            aas_repo_id: "default".into(),
            submodel_repo_id: None,
            http_timeout_secs: 30.0,
            breaker: BreakerSettings::default(),
        }
    }
}

/// Event bus connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Broker hostname.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client id.
    pub client_id: String,
    /// Optional username.
    pub username: Option<String>,
    /// Optional password; `TWINWARD_BUS_PASSWORD` overrides.
    pub password: Option<String>,
    /// Initial reconnect delay in seconds.
    pub base_reconnect_delay_secs: f64,
    /// Reconnect delay cap in seconds.
    pub max_reconnect_delay_secs: f64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "twinward-agent".into(),
            username: None,
            password: None,
            base_reconnect_delay_secs: 5.0,
            max_reconnect_delay_secs: 60.0,
        }
    }
}

/// Language model selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LmSettings {
    /// Which planner serves requests.
    pub provider: LmProvider,
    /// OpenAI-compatible endpoint base URL.
    pub base_url: String,
    /// API key; `TWINWARD_LLM_API_KEY` overrides.
    pub api_key: Option<String>,
    /// Model identifier.
    pub model: String,
    /// Response token cap.
    pub max_tokens: u32,
    /// Concurrent model calls; `None` for unlimited.
    pub concurrency_limit: Option<usize>,
    /// Breaker around the model client.
    pub breaker: BreakerSettings,
}

impl Default for LmSettings {
    fn default() -> Self {
        Self {
            provider: LmProvider::Rules,
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
            model: "gpt-4o-mini".into(),
            max_tokens: 4096,
            concurrency_limit: Some(4),
            breaker: BreakerSettings::default(),
        }
    }
}

/// Safety kernel knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetySettings {
    /// Submodel id of the PolicyTwin.
    pub policy_submodel_id: String,
    /// Reject unsigned or unverifiable policies.
    pub policy_verification_required: bool,
    /// Deny when an interlock property is missing from the shadow.
    pub interlock_fail_safe: bool,
    /// Policy cache TTL in seconds.
    pub policy_cache_ttl_seconds: u64,
    /// Hard upper bound on cached-policy age in seconds.
    pub policy_max_age_seconds: Option<u64>,
    /// Approval wait deadline in seconds.
    pub approval_timeout_secs: f64,
    /// Audit log path.
    pub audit_log_path: String,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            policy_submodel_id: "urn:example:submodel:policy".into(),
            policy_verification_required: true,
            interlock_fail_safe: true,
            policy_cache_ttl_seconds: 300,
            policy_max_age_seconds: None,
            approval_timeout_secs: 3600.0,
            audit_log_path: "audit_logs/audit.jsonl".into(),
        }
    }
}

/// Async-job monitoring knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Shadow poll interval in seconds.
    pub poll_interval_secs: f64,
    /// Overall job deadline in seconds.
    pub timeout_secs: f64,
    /// Consecutive stale polls before one HTTP status check.
    pub http_fallback_polls: u32,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 1.0,
            timeout_secs: 300.0,
            http_fallback_polls: 5,
        }
    }
}

/// Capability retrieval knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilitySettings {
    /// Tools retrieved per query.
    pub top_k: usize,
    /// Tool names always included in retrieval results.
    pub always_include: Vec<String>,
}

impl Default for CapabilitySettings {
    fn default() -> Self {
        Self {
            top_k: 12,
            always_include: Vec::new(),
        }
    }
}

/// Public HTTP surface knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address.
    pub bind: String,
    /// Authentication mode.
    pub auth_mode: AuthMode,
    /// Roles assumed when the caller presents none.
    pub default_roles: Vec<String>,
    /// Trusted proxy header carrying the client-certificate subject.
    pub mtls_subject_header: String,
    /// Certificate subject → roles, for mTLS mode.
    pub subject_roles: BTreeMap<String, Vec<String>>,
    /// Sustained admission rate per client.
    pub rate_limit_rpm: f64,
    /// Burst size; defaults to twice the per-second rate.
    pub rate_limit_burst: Option<f64>,
    /// Paths exempt from rate limiting.
    pub rate_limit_exclude_paths: Vec<String>,
    /// Seconds to wait for in-flight requests on shutdown.
    pub drain_timeout_secs: f64,
    /// Bound on concurrent twin invocations.
    pub tool_concurrency_limit: Option<usize>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
            auth_mode: AuthMode::None,
            default_roles: vec!["viewer".into()],
            mtls_subject_header: "x-client-subject".into(),
            subject_roles: BTreeMap::new(),
            rate_limit_rpm: 60.0,
            rate_limit_burst: None,
            rate_limit_exclude_paths: vec!["/health".into(), "/ready".into(), "/metrics".into()],
            drain_timeout_secs: 30.0,
            tool_concurrency_limit: Some(8),
        }
    }
}

/// Top-level agent settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Twin repository connection.
    pub twin: TwinSettings,
    /// Event bus connection.
    pub bus: BusSettings,
    /// Language model selection.
    pub llm: LmSettings,
    /// Safety kernel knobs.
    pub safety: SafetySettings,
    /// Async-job monitoring knobs.
    pub jobs: JobSettings,
    /// Capability retrieval knobs.
    pub capability: CapabilitySettings,
    /// Public HTTP surface knobs.
    pub server: ServerSettings,
}

impl Settings {
    /// Load settings from a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::FileNotFound`] or [`ConfigError::ParseError`].
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })
    }

    /// Apply environment-variable overrides for secrets.
    ///
    /// `TWINWARD_LLM_API_KEY` and `TWINWARD_BUS_PASSWORD` take precedence
    /// over file values so secrets stay out of config files.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("TWINWARD_LLM_API_KEY")
            && !key.is_empty()
        {
            self.llm.api_key = Some(key);
        }
        if let Ok(password) = std::env::var("TWINWARD_BUS_PASSWORD")
            && !password.is_empty()
        {
            self.bus.password = Some(password);
        }
    }

    /// Collect advisory warnings about risky settings.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        if !self.safety.policy_verification_required {
            warnings.push(ConfigWarning::PolicyVerificationDisabled);
        }
        if !self.safety.interlock_fail_safe {
            warnings.push(ConfigWarning::InterlockFailOpen);
        }
        if self.server.auth_mode == AuthMode::None {
            warnings.push(ConfigWarning::UnauthenticatedRoles);
        }
        if self.server.rate_limit_rpm < 1.0 || self.server.rate_limit_rpm > 100_000.0 {
            warnings.push(ConfigWarning::UnusualRateLimit {
                rpm: self.server.rate_limit_rpm,
            });
        }
        warnings
    }
}
