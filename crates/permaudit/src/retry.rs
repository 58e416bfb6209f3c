//! Retry utilities for API requests.
//!
//! Every GraphQL request goes through [`with_retry`]: transient failures are
//! retried with exponential backoff and jitter, terminal failures surface on
//! the first attempt, and a transient failure that outlives the attempt
//! budget becomes [`AuditError::RetryExhausted`].

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::error::{AuditError, short_error_message};
use crate::progress::{AuditProgress, ProgressCallback, emit};

/// Maximum backoff delay in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Initial backoff delay in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Total attempts for one request, including the first.
pub const MAX_ATTEMPTS: usize = 5;

/// Configuration for retry operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Minimum delay between retries.
    pub min_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    /// Whether to add jitter to delays.
    pub with_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_delay: Duration::from_millis(MAX_BACKOFF_MS),
            max_attempts: MAX_ATTEMPTS,
            with_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with custom values.
    #[must_use]
    pub fn new(min_delay: Duration, max_delay: Duration, max_attempts: usize) -> Self {
        Self {
            min_delay,
            max_delay,
            max_attempts,
            with_jitter: true,
        }
    }

    /// Set whether to use jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.with_jitter = jitter;
        self
    }

    /// Build an exponential backoff strategy from this configuration.
    #[must_use]
    pub fn into_backoff(self) -> ExponentialBuilder {
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1));

        if self.with_jitter {
            builder = builder.with_jitter();
        }

        builder
    }
}

/// Execute a request with automatic retry on transient errors.
///
/// `scope` names the request (for example `collaborators(acme/api) page 2`)
/// and ends up in logs, progress events and the exhaustion error.
pub async fn with_retry<T, F, Fut>(
    operation: F,
    config: &RetryConfig,
    scope: &str,
    on_progress: Option<&ProgressCallback>,
) -> Result<T, AuditError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AuditError>>,
{
    let mut operation = operation;
    let attempt = AtomicU32::new(0);

    let retry_op = || {
        attempt.fetch_add(1, Ordering::SeqCst);
        operation()
    };

    let result = retry_op
        .retry(config.clone().into_backoff())
        .notify(|err: &AuditError, dur: Duration| {
            let current_attempt = attempt.load(Ordering::SeqCst);
            emit(
                on_progress,
                AuditProgress::RetryBackoff {
                    scope: scope.to_string(),
                    retry_after_ms: dur.as_millis() as u64,
                    attempt: current_attempt,
                    error: short_error_message(err),
                },
            );
            tracing::debug!(
                "Retrying {} in {:?} (attempt {}): {}",
                scope,
                dur,
                current_attempt,
                short_error_message(err)
            );
        })
        .when(AuditError::is_retryable)
        .await;

    match result {
        Err(err) if err.is_retryable() => {
            let attempts = attempt.load(Ordering::SeqCst) as usize;
            tracing::warn!(scope, attempts, error = %err, "Retries exhausted");
            Err(AuditError::RetryExhausted {
                scope: scope.to_string(),
                attempts,
                last_error: short_error_message(&err),
            })
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn fast_config() -> RetryConfig {
        RetryConfig::new(Duration::from_millis(10), Duration::from_millis(50), 5).with_jitter(false)
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();

        assert_eq!(config.min_delay, Duration::from_millis(INITIAL_BACKOFF_MS));
        assert_eq!(config.max_delay, Duration::from_millis(MAX_BACKOFF_MS));
        assert_eq!(config.max_attempts, MAX_ATTEMPTS);
        assert!(config.with_jitter);
    }

    #[test]
    fn test_retry_config_custom() {
        let config = RetryConfig::new(Duration::from_secs(2), Duration::from_secs(30), 3);

        assert_eq!(config.min_delay, Duration::from_secs(2));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_attempts, 3);
        assert!(config.with_jitter);
    }

    #[test]
    fn test_retry_config_without_jitter() {
        let config = RetryConfig::default().with_jitter(false);
        assert!(!config.with_jitter);
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_retries_transient_errors_and_emits_progress() {
        let calls = Arc::new(AtomicU32::new(0));

        let events: Arc<Mutex<Vec<AuditProgress>>> = Arc::new(Mutex::new(Vec::new()));
        let events_capture = Arc::clone(&events);
        let callback: ProgressCallback = Box::new(move |event| {
            events_capture
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(event);
        });

        let calls_capture = Arc::clone(&calls);
        let operation = move || {
            let calls_capture = Arc::clone(&calls_capture);
            async move {
                let n = calls_capture.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(AuditError::Server { status: 502 })
                } else {
                    Ok(42u32)
                }
            }
        };

        let result = with_retry(operation, &fast_config(), "repos page 1", Some(&callback)).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let events = events.lock().unwrap_or_else(|e| e.into_inner());
        let backoffs = events
            .iter()
            .filter(|e| matches!(e, AuditProgress::RetryBackoff { .. }))
            .count();
        assert_eq!(backoffs, 2);
    }

    #[tokio::test]
    async fn with_retry_does_not_retry_terminal_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_capture = Arc::clone(&calls);

        let operation = move || {
            let calls_capture = Arc::clone(&calls_capture);
            async move {
                calls_capture.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AuditError::auth("Bad credentials"))
            }
        };

        let err = with_retry(operation, &fast_config(), "viewer", None)
            .await
            .expect_err("expected error");

        assert!(matches!(err, AuditError::Auth { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_reports_exhaustion_after_attempt_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_capture = Arc::clone(&calls);

        let operation = move || {
            let calls_capture = Arc::clone(&calls_capture);
            async move {
                calls_capture.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AuditError::Transport {
                    message: "connection reset".to_string(),
                })
            }
        };

        let err = with_retry(operation, &fast_config(), "repos page 3", None)
            .await
            .expect_err("expected exhaustion");

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        match err {
            AuditError::RetryExhausted {
                scope,
                attempts,
                last_error,
            } => {
                assert_eq!(scope, "repos page 3");
                assert_eq!(attempts, 5);
                assert!(last_error.contains("connection reset"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
