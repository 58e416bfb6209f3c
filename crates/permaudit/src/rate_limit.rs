//! Shared rate-limit governor.
//!
//! One [`RateGovernor`] is created per run and cloned into every caller that
//! talks to the API. It combines three waits:
//! - a secondary-limit cooldown (retry-after or exponential),
//! - a primary-quota pause until the reset instant once remaining quota drops
//!   to the low-water mark,
//! - an optional proactive pacer built on the `governor` crate.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::http::{HttpHeaders, header_get};

/// Type alias for the governor rate limiter.
type GovernorRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Default tuning values.
pub mod defaults {
    use std::time::Duration;

    /// Pause once remaining quota is at or below this value.
    pub const LOW_WATERMARK: u64 = 100;
    /// Extra time slept past the advertised reset.
    pub const RESET_BUFFER: Duration = Duration::from_secs(10);
    /// Upper bound for a single primary-quota pause.
    pub const MAX_RESET_WAIT: Duration = Duration::from_secs(60 * 60);
    /// First secondary-limit cooldown when no retry-after is given.
    pub const SECONDARY_BASE: Duration = Duration::from_secs(60);
    /// Ceiling for the exponential secondary cooldown.
    pub const SECONDARY_MAX: Duration = Duration::from_secs(15 * 60);
    /// GraphQL allows 5000 points/hour; 10/sec leaves room for bursts.
    pub const REQUESTS_PER_SECOND: u32 = 10;
}

/// Tuning for a [`RateGovernor`].
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub low_watermark: u64,
    pub reset_buffer: Duration,
    pub max_reset_wait: Duration,
    pub secondary_base: Duration,
    pub secondary_max: Duration,
    /// Proactive pacing; `None` disables it.
    pub requests_per_second: Option<NonZeroU32>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            low_watermark: defaults::LOW_WATERMARK,
            reset_buffer: defaults::RESET_BUFFER,
            max_reset_wait: defaults::MAX_RESET_WAIT,
            secondary_base: defaults::SECONDARY_BASE,
            secondary_max: defaults::SECONDARY_MAX,
            requests_per_second: NonZeroU32::new(defaults::REQUESTS_PER_SECOND),
        }
    }
}

impl GovernorConfig {
    /// Disable proactive pacing.
    #[must_use]
    pub fn without_pacing(mut self) -> Self {
        self.requests_per_second = None;
        self
    }
}

/// Primary quota state as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub limit: Option<u64>,
    pub remaining: u64,
    pub used: Option<u64>,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitSnapshot {
    /// Parse `x-ratelimit-*` response headers.
    ///
    /// Returns `None` unless both `remaining` and `reset` are present.
    pub fn from_headers(headers: &HttpHeaders) -> Option<Self> {
        let parse = |name: &str| header_get(headers, name).and_then(|v| v.trim().parse::<u64>().ok());

        let remaining = parse("x-ratelimit-remaining")?;
        let reset_epoch = parse("x-ratelimit-reset")?;
        let reset_at = i64::try_from(reset_epoch)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);

        Some(Self {
            limit: parse("x-ratelimit-limit"),
            remaining,
            used: parse("x-ratelimit-used"),
            reset_at,
        })
    }
}

/// Parse a `retry-after` header expressed in seconds.
pub fn retry_after_from_headers(headers: &HttpHeaders) -> Option<Duration> {
    header_get(headers, "retry-after")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[derive(Debug, Default)]
struct GovernorState {
    last: Option<RateLimitSnapshot>,
    /// Primary-quota pause in effect until this instant.
    resume_at: Option<Instant>,
    /// Secondary-limit cooldown in effect until this instant.
    cooldown_until: Option<Instant>,
    secondary_strikes: u32,
    waits: u64,
}

/// Shared, cloneable rate-limit governor.
///
/// All clones share one critical section; waits are computed under the lock
/// and slept outside it.
#[derive(Clone)]
pub struct RateGovernor {
    state: Arc<Mutex<GovernorState>>,
    pacer: Option<Arc<GovernorRateLimiter>>,
    config: Arc<GovernorConfig>,
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new(GovernorConfig::default())
    }
}

impl RateGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        let pacer = config
            .requests_per_second
            .map(|rps| Arc::new(RateLimiter::direct(Quota::per_second(rps))));

        Self {
            state: Arc::new(Mutex::new(GovernorState::default())),
            pacer,
            config: Arc::new(config),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until the next call is estimated to stay within quota.
    ///
    /// Re-checks after every sleep so that a cooldown extended by another
    /// worker in the meantime is honored.
    pub async fn before_call(&self) {
        loop {
            let wait = self.pending_wait();
            if wait.is_zero() {
                break;
            }
            tracing::warn!(wait_secs = wait.as_secs_f64(), "Rate limit pause");
            tokio::time::sleep(wait).await;
        }

        if let Some(ref pacer) = self.pacer {
            pacer.until_ready().await;
        }
    }

    /// How long a caller would have to wait right now.
    pub fn pending_wait(&self) -> Duration {
        let now = Instant::now();
        let mut state = self.lock();

        if state.resume_at.is_some_and(|at| at <= now) {
            state.resume_at = None;
        }
        if state.cooldown_until.is_some_and(|at| at <= now) {
            state.cooldown_until = None;
        }

        let wait = [state.resume_at, state.cooldown_until]
            .into_iter()
            .flatten()
            .map(|at| at.saturating_duration_since(now))
            .max()
            .unwrap_or_default();

        if !wait.is_zero() {
            state.waits += 1;
        }
        wait
    }

    /// Record primary quota state from a response.
    ///
    /// A response that arrives late reports more quota than a newer one from
    /// the same window; such snapshots are ignored.
    pub fn observe(&self, snapshot: &RateLimitSnapshot) {
        let mut state = self.lock();

        if let Some(ref last) = state.last
            && last.reset_at == snapshot.reset_at
            && snapshot.remaining > last.remaining
        {
            tracing::trace!(
                remaining = snapshot.remaining,
                last_remaining = last.remaining,
                "Ignoring stale quota snapshot"
            );
            return;
        }

        if snapshot.remaining <= self.config.low_watermark {
            let until_reset = (snapshot.reset_at - Utc::now())
                .to_std()
                .unwrap_or_default();
            let wait = (until_reset + self.config.reset_buffer).min(self.config.max_reset_wait);
            tracing::debug!(
                remaining = snapshot.remaining,
                reset_at = %snapshot.reset_at,
                wait_secs = wait.as_secs(),
                "Primary quota low"
            );
            state.resume_at = Some(Instant::now() + wait);
        } else {
            state.resume_at = None;
        }

        state.last = Some(snapshot.clone());
    }

    /// Record a secondary (abuse-prevention) limit signal.
    ///
    /// Returns the cooldown that was applied.
    pub fn observe_secondary(&self, retry_after: Option<Duration>) -> Duration {
        let mut state = self.lock();

        let cooldown = match retry_after {
            Some(d) => d,
            None => {
                let factor = 2u32.saturating_pow(state.secondary_strikes.min(16));
                self.config
                    .secondary_base
                    .saturating_mul(factor)
                    .min(self.config.secondary_max)
            }
        };
        state.secondary_strikes = state.secondary_strikes.saturating_add(1);

        let until = Instant::now() + cooldown;
        state.cooldown_until = Some(state.cooldown_until.map_or(until, |at| at.max(until)));

        tracing::warn!(
            cooldown_secs = cooldown.as_secs(),
            strikes = state.secondary_strikes,
            "Secondary rate limit cooldown"
        );
        cooldown
    }

    /// Reset the secondary-limit backoff after a successful call.
    pub fn note_success(&self) {
        self.lock().secondary_strikes = 0;
    }

    /// Last primary quota snapshot observed, if any.
    pub fn last_snapshot(&self) -> Option<RateLimitSnapshot> {
        self.lock().last.clone()
    }

    /// Number of times a caller had to pause.
    pub fn wait_count(&self) -> u64 {
        self.lock().waits
    }
}
