// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request authentication: header-asserted roles or mTLS via trusted proxy.

use crate::ApiError;
use axum::http::{HeaderMap, StatusCode};
use twd_config::{AuthMode, Settings};

/// Authenticated request identity.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Authenticated subject, when the mode provides one.
    pub subject: Option<String>,
    /// Effective roles.
    pub roles: Vec<String>,
}

fn parse_roles(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}

/// Authenticate a request from its headers.
///
/// - `none`: roles come straight from `X-Roles` (or the configured
///   defaults); there is no subject.
/// - `mtls`: the subject comes from the trusted proxy header carrying the
///   client-certificate subject and maps to roles via `subject_roles`.
///
/// # Errors
///
/// 401 in mTLS mode when no subject header is present.
pub fn authenticate(headers: &HeaderMap, settings: &Settings) -> Result<AuthContext, ApiError> {
    match settings.server.auth_mode {
        AuthMode::None => {
            let roles = headers
                .get("x-roles")
                .and_then(|v| v.to_str().ok())
                .map(parse_roles)
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| settings.server.default_roles.clone());
            Ok(AuthContext {
                subject: None,
                roles,
            })
        }
        AuthMode::Mtls => {
            let subject = headers
                .get(settings.server.mtls_subject_header.as_str())
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| {
                    ApiError::new(StatusCode::UNAUTHORIZED, "client certificate subject missing")
                })?;
            let roles = settings
                .server
                .subject_roles
                .get(&subject)
                .cloned()
                .unwrap_or_else(|| settings.server.default_roles.clone());
            Ok(AuthContext {
                subject: Some(subject),
                roles,
            })
        }
    }
}
