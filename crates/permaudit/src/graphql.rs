//! GraphQL client for the GitHub API.
//!
//! Every request goes through the shared [`RateGovernor`] and the retry
//! policy. Responses are classified into transient failures (retried),
//! terminal failures (auth, unexpected errors) and successful envelopes whose
//! remaining GraphQL errors are left for the query to interpret.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{AuditError, Result, missing_scopes};
use crate::http::{HttpMethod, HttpRequest, HttpResponse, HttpTransport};
use crate::progress::ProgressCallback;
use crate::rate_limit::{RateGovernor, RateLimitSnapshot, retry_after_from_headers};
use crate::retry::{RetryConfig, with_retry};

/// Default GitHub GraphQL endpoint.
pub const GITHUB_GRAPHQL_URL: &str = "https://api.github.com/graphql";

/// User agent sent with every request.
pub const USER_AGENT: &str = concat!("permaudit/", env!("CARGO_PKG_VERSION"));

/// Fallback wait when the service reports `RATE_LIMITED` without headers.
const RATE_LIMITED_FALLBACK_SECS: i64 = 60;

/// One entry of the GraphQL `errors` array.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphQlError {
    pub message: String,
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub path: Vec<Value>,
}

/// A successful GraphQL envelope.
///
/// `data` may be partial (fields nulled out) when `errors` is non-empty.
#[derive(Debug, Clone)]
pub struct GraphQlResponse {
    pub data: Value,
    pub errors: Vec<GraphQlError>,
}

impl GraphQlResponse {
    /// Decode `data` into a typed response.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| AuditError::decode(e.to_string()))
    }

    /// Whether any error carries the given `type`.
    pub fn has_error_type(&self, error_type: &str) -> bool {
        self.error_of_type(error_type).is_some()
    }

    /// First error with the given `type`.
    pub fn error_of_type(&self, error_type: &str) -> Option<&GraphQlError> {
        self.errors
            .iter()
            .find(|e| e.error_type.as_deref() == Some(error_type))
    }

    /// Messages of all errors, joined for display.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Value,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

/// Governed, retrying GraphQL client.
///
/// Cheap to clone; clones share the transport, the governor and the query
/// counter.
#[derive(Clone)]
pub struct GraphQlClient {
    transport: Arc<dyn HttpTransport>,
    endpoint: Arc<str>,
    token: Arc<str>,
    governor: RateGovernor,
    retry: RetryConfig,
    queries: Arc<AtomicU64>,
    granted_scopes: Arc<Mutex<Option<String>>>,
}

impl fmt::Debug for GraphQlClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphQlClient")
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl GraphQlClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        token: impl Into<String>,
        governor: RateGovernor,
    ) -> Self {
        Self {
            transport,
            endpoint: Arc::from(GITHUB_GRAPHQL_URL),
            token: Arc::from(token.into()),
            governor,
            retry: RetryConfig::default(),
            queries: Arc::new(AtomicU64::new(0)),
            granted_scopes: Arc::new(Mutex::new(None)),
        }
    }

    /// Point the client at another endpoint (GitHub Enterprise, tests).
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Arc::from(endpoint.into());
        self
    }

    #[must_use]
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }

    /// Requests sent so far, retries included.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Last `X-OAuth-Scopes` header seen, if the credential reports one.
    pub fn granted_scopes(&self) -> Option<String> {
        self.granted_scopes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Execute one GraphQL request with rate governing and retries.
    ///
    /// `scope` labels the request in logs and in the exhaustion error.
    pub async fn execute(
        &self,
        document: &str,
        variables: Value,
        scope: &str,
        on_progress: Option<&ProgressCallback>,
    ) -> Result<GraphQlResponse> {
        let body = serde_json::to_vec(&serde_json::json!({
            "query": document,
            "variables": variables,
        }))
        .map_err(|e| AuditError::decode(e.to_string()))?;

        with_retry(|| self.send_once(&body, scope), &self.retry, scope, on_progress).await
    }

    async fn send_once(&self, body: &[u8], scope: &str) -> Result<GraphQlResponse> {
        self.governor.before_call().await;

        let request = HttpRequest {
            method: HttpMethod::Post,
            url: self.endpoint.to_string(),
            headers: vec![
                ("Authorization".to_string(), format!("Bearer {}", self.token)),
                ("User-Agent".to_string(), USER_AGENT.to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
            ],
            body: body.to_vec(),
        };

        let response = self.transport.send(request).await?;
        self.queries.fetch_add(1, Ordering::Relaxed);

        if let Some(scopes) = response.header("x-oauth-scopes") {
            *self
                .granted_scopes
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(scopes.to_string());
        }

        let snapshot = RateLimitSnapshot::from_headers(&response.headers);
        if let Some(ref snapshot) = snapshot {
            self.governor.observe(snapshot);
        }

        tracing::debug!(scope, status = response.status, "GraphQL response");
        classify_response(&self.governor, snapshot, response)
    }
}

/// Turn an HTTP response into an envelope or a classified error.
fn classify_response(
    governor: &RateGovernor,
    snapshot: Option<RateLimitSnapshot>,
    response: HttpResponse,
) -> Result<GraphQlResponse> {
    let status = response.status;
    let granted = response.header("x-oauth-scopes").map(str::to_string);

    match status {
        200..=299 => governor.note_success(),
        401 => {
            return Err(AuditError::Auth {
                message: body_message(&response.body).unwrap_or_else(|| "Bad credentials".into()),
                missing_scopes: missing_scopes(granted.as_deref()),
            });
        }
        403 | 429 => {
            let retry_after = retry_after_from_headers(&response.headers);
            let message = body_message(&response.body).unwrap_or_default();
            let secondary = status == 429
                || retry_after.is_some()
                || message.to_ascii_lowercase().contains("secondary rate limit");

            if secondary {
                let applied = governor.observe_secondary(retry_after);
                return Err(AuditError::SecondaryRateLimited {
                    retry_after: Some(applied),
                });
            }
            if let Some(snapshot) = snapshot.filter(|s| s.remaining == 0) {
                return Err(AuditError::RateLimited {
                    reset_at: snapshot.reset_at,
                });
            }
            return Err(AuditError::Auth {
                message: if message.is_empty() {
                    "Forbidden".to_string()
                } else {
                    message
                },
                missing_scopes: missing_scopes(granted.as_deref()),
            });
        }
        500..=599 => return Err(AuditError::Server { status }),
        _ => {
            let message = body_message(&response.body).unwrap_or_default();
            return Err(AuditError::api(format!("HTTP {status}: {message}")));
        }
    }

    let envelope: Envelope =
        serde_json::from_slice(&response.body).map_err(|e| AuditError::decode(e.to_string()))?;
    let parsed = GraphQlResponse {
        data: envelope.data,
        errors: envelope.errors,
    };

    if parsed.has_error_type("RATE_LIMITED") {
        let reset_at = match snapshot {
            Some(s) => s.reset_at,
            None => {
                let fallback = RateLimitSnapshot {
                    limit: None,
                    remaining: 0,
                    used: None,
                    reset_at: Utc::now() + chrono::Duration::seconds(RATE_LIMITED_FALLBACK_SECS),
                };
                governor.observe(&fallback);
                fallback.reset_at
            }
        };
        return Err(AuditError::RateLimited { reset_at });
    }

    if let Some(err) = parsed.error_of_type("INSUFFICIENT_SCOPES") {
        return Err(AuditError::Auth {
            message: err.message.clone(),
            missing_scopes: missing_scopes(granted.as_deref()),
        });
    }

    if parsed.data.is_null() {
        if parsed.errors.is_empty() {
            return Err(AuditError::decode("response carried neither data nor errors"));
        }
        let locally_handled =
            parsed.has_error_type("NOT_FOUND") || parsed.has_error_type("FORBIDDEN");
        if !locally_handled {
            return Err(AuditError::api(parsed.error_summary()));
        }
    }

    Ok(parsed)
}

/// Extract `message` from a JSON error body, or the raw text.
fn body_message(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(parsed) => Some(parsed.message),
        Err(_) => {
            let text = String::from_utf8_lossy(body);
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.chars().take(200).collect())
        }
    }
}
