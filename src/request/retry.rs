//! Retry classification and sleep-based backoff for loc.gov requests.
//!
//! Failed requests are classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - may succeed on retry (5xx, network, timeout)
//! - [`FailureType::Permanent`] - retrying will not help (404, 403, bad JSON)
//! - [`FailureType::RateLimited`] - the server returned 429; the session stops
//!
//! [`RetryPolicy`] then decides whether to retry and for how long to sleep.
//! Backoff grows linearly with the attempt number (`base_pause * attempt`,
//! capped), the pacing loc.gov documents for bulk clients, with a little
//! jitter so parallel harvests on one network do not sync up.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::ApiError;

/// Default maximum attempts, including the initial one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Default base pause between attempts (5 seconds).
const DEFAULT_BASE_PAUSE: Duration = Duration::from_secs(5);

/// Default cap on any single backoff sleep (2 minutes).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(120);

/// Maximum jitter added to delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of request failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network timeout, 5xx server errors, partial records.
    Transient,

    /// Failure that won't succeed regardless of retries.
    ///
    /// Examples: 404 Not Found, 403 Forbidden, invalid JSON.
    Permanent,

    /// Server rate limiting (HTTP 429). Terminal for the whole session.
    RateLimited,
}

/// Decision on whether to retry a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to sleep before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with linear backoff.
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_pause * attempt, max_delay) + jitter
/// ```
///
/// With defaults, sleeps are approximately 5s, 10s, 15s, ...
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base pause; the first retry waits this long.
    base_pause: Duration,

    /// Cap on any single delay.
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_pause: DEFAULT_BASE_PAUSE,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    ///
    /// `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, base_pause: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_pause,
            max_delay,
        }
    }

    /// Creates a policy with a custom attempt count, defaults elsewhere.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Creates a policy with custom attempts and base pause, default cap.
    #[must_use]
    pub fn with_attempts_and_pause(max_attempts: u32, base_pause: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_pause,
            ..Self::default()
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the base pause between attempts.
    #[must_use]
    pub fn base_pause(&self) -> Duration {
        self.base_pause
    }

    /// Determines whether to retry a failed request.
    ///
    /// `attempt` is the attempt number that just failed (1-indexed).
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        match failure_type {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            FailureType::RateLimited => {
                return RetryDecision::DoNotRetry {
                    reason: "rate limited (429) - session requests are halted".to_string(),
                };
            }
            FailureType::Transient => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Calculates the sleep before the retry that follows `attempt`.
    ///
    /// Formula: `min(base_pause * attempt, max_delay) + jitter`
    pub(crate) fn calculate_delay(&self, attempt: u32) -> Duration {
        let scaled = self.base_pause.saturating_mul(attempt.max(1));
        scaled.min(self.max_delay) + calculate_jitter()
    }
}

/// Generates random jitter between 0 and [`MAX_JITTER`].
#[allow(clippy::cast_possible_truncation)]
fn calculate_jitter() -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_ms = rng.gen_range(0..=MAX_JITTER.as_millis() as u64);
    Duration::from_millis(jitter_ms)
}

/// Classifies a request error into a failure type for retry decisions.
///
/// # HTTP Status Code Classification
///
/// | Status | Type | Rationale |
/// |--------|------|-----------|
/// | 403 | Permanent | Forbidden - the API will keep refusing |
/// | 404 | Permanent | Not found - record doesn't exist |
/// | 408 | Transient | Request timeout - may succeed |
/// | 429 | RateLimited | Too many requests - halt the session |
/// | 5xx | Transient | Server trouble - may be temporary |
///
/// Timeouts and most network errors are transient; TLS failures, invalid
/// JSON, and exhausted retries are permanent.
#[instrument]
pub fn classify_error(error: &ApiError) -> FailureType {
    match error {
        ApiError::Status { status, .. } => classify_http_status(*status),

        ApiError::Timeout { .. } => FailureType::Transient,

        ApiError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }

        ApiError::Blocked { .. } => FailureType::RateLimited,

        ApiError::NotFound { .. }
        | ApiError::Forbidden { .. }
        | ApiError::InvalidJson { .. }
        | ApiError::Exhausted { .. }
        | ApiError::Build { .. } => FailureType::Permanent,
    }
}

/// Classifies an HTTP status code into a failure type.
fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        status if (400..500).contains(&status) => FailureType::Permanent,
        status if (500..600).contains(&status) => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}
