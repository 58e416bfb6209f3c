//! Error types for the audit engine.
//!
//! Errors fall into four classes:
//! - transient (transport, 5xx, primary and secondary rate limits), which are
//!   retried and only escape as [`AuditError::RetryExhausted`];
//! - terminal auth and not-found failures, which abort the run immediately;
//! - data anomalies, which never become errors (see [`crate::AnomalyCounts`]);
//! - cancellation.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::http::HttpError;

/// OAuth scopes the audit relies on.
pub const REQUIRED_SCOPES: [&str; 3] = ["repo", "read:org", "read:user"];

/// Errors that can occur while auditing an organization.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Network failure or timeout before a response arrived.
    #[error("Network error: {message}")]
    Transport { message: String },

    /// The service answered with a 5xx status.
    #[error("Server error: HTTP {status}")]
    Server { status: u16 },

    /// Primary quota exhausted.
    #[error("Rate limit exceeded. Resets at {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    /// Secondary (abuse-prevention) limit hit.
    #[error("Secondary rate limit hit{}", format_retry_after(.retry_after))]
    SecondaryRateLimited { retry_after: Option<Duration> },

    /// Invalid, expired or under-scoped credential.
    #[error("Authentication failed: {message}{}", format_scopes(.missing_scopes))]
    Auth {
        message: String,
        missing_scopes: Vec<String>,
    },

    /// Organization unknown or not visible to the credential.
    #[error("Organization not found: {0}")]
    OrgNotFound(String),

    /// A retryable failure persisted through every attempt.
    #[error("{scope}: giving up after {attempts} attempts: {last_error}")]
    RetryExhausted {
        scope: String,
        attempts: usize,
        last_error: String,
    },

    /// Unexpected GraphQL error or HTTP status.
    #[error("API error: {message}")]
    Api { message: String },

    /// The response envelope could not be decoded.
    #[error("Failed to decode response: {message}")]
    Decode { message: String },

    /// The run was cancelled before traversal finished.
    #[error("Audit cancelled")]
    Cancelled,
}

fn format_retry_after(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {}s", d.as_secs()),
        None => String::new(),
    }
}

fn format_scopes(scopes: &[String]) -> String {
    if scopes.is_empty() {
        String::new()
    } else {
        format!(" (missing scopes: {})", scopes.join(", "))
    }
}

/// Classified reason for a failed run, used by callers to pick an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Auth,
    NotFound,
    RetryExhausted,
    Cancelled,
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Auth => "auth",
            FailureKind::NotFound => "organization-not-found",
            FailureKind::RetryExhausted => "retry-exhausted",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Other => "other",
        };
        f.write_str(s)
    }
}

impl AuditError {
    /// Create an API error.
    #[inline]
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            message: message.into(),
        }
    }

    /// Create a decode error.
    #[inline]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create an auth error without scope information.
    #[inline]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
            missing_scopes: Vec::new(),
        }
    }

    /// Whether the failure is transient and the same request may be retried.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::Server { .. }
                | Self::RateLimited { .. }
                | Self::SecondaryRateLimited { .. }
        )
    }

    /// Check if this error is a rate limit error (primary or secondary).
    #[inline]
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::SecondaryRateLimited { .. }
        )
    }

    /// Classify the error for exit signaling.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Auth { .. } => FailureKind::Auth,
            Self::OrgNotFound(_) => FailureKind::NotFound,
            Self::RetryExhausted { .. } => FailureKind::RetryExhausted,
            Self::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Other,
        }
    }
}

impl From<HttpError> for AuditError {
    fn from(err: HttpError) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }
}

/// Compute which of [`REQUIRED_SCOPES`] are absent from an `X-OAuth-Scopes` header.
///
/// `repo` implies nothing else; `admin:org` and `write:org` imply `read:org`;
/// `user` implies `read:user`. Fine-grained tokens send no header, in which
/// case nothing can be derived and an empty list is returned.
pub fn missing_scopes(granted_header: Option<&str>) -> Vec<String> {
    let Some(header) = granted_header else {
        return Vec::new();
    };

    let granted: Vec<&str> = header
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let has = |scope: &str| -> bool {
        granted.iter().any(|g| {
            *g == scope
                || (scope == "read:org" && (*g == "admin:org" || *g == "write:org"))
                || (scope == "read:user" && *g == "user")
        })
    };

    REQUIRED_SCOPES
        .iter()
        .filter(|scope| !has(scope))
        .map(|scope| (*scope).to_string())
        .collect()
}

/// Extract a short error message suitable for display.
///
/// Takes the first line of an error message, which is useful for errors
/// that include multi-line details.
#[inline]
pub fn short_error_message(e: &impl std::error::Error) -> String {
    let full = e.to_string();
    full.lines().next().unwrap_or(&full).to_string()
}

/// Result type for audit operations.
pub type Result<T> = std::result::Result<T, AuditError>;
