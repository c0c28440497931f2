//! Retry policy with capped exponential backoff for transient send failures.
//!
//! This module provides the [`RetryPolicy`] and [`FailureType`] types used by
//! [`RetryingSender`](super::RetryingSender) to decide whether an attempt
//! should be repeated.
//!
//! # Overview
//!
//! Every failed attempt is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - Temporary failures that may succeed on retry
//! - [`FailureType::RateLimited`] - Server rate limiting (retries with backoff)
//! - [`FailureType::Permanent`] - Failures that won't succeed regardless of retries
//!
//! Responses classified as permanent are not failures from the sender's point
//! of view: they are handed back to the caller untouched.
//!
//! # Example
//!
//! ```
//! use fetchkit_core::download::{RetryDecision, RetryPolicy};
//! use reqwest::StatusCode;
//!
//! let policy = RetryPolicy::new(3);
//! let failure = policy.classify_status(StatusCode::SERVICE_UNAVAILABLE);
//!
//! match policy.should_retry(failure, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use tracing::{debug, instrument};

use super::TransportError;

/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff (500 milliseconds).
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Default maximum delay cap (30 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network timeout, 5xx server errors, connection refused.
    Transient,

    /// Server rate limiting (HTTP 429).
    RateLimited,

    /// Failure that won't succeed regardless of retries.
    ///
    /// Examples: 404 Not Found, 400 Bad Request, malformed request.
    Permanent,
}

impl FailureType {
    /// Whether this failure type may be retried at all.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited)
    }
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
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

/// Classifier deciding how a response status should be treated.
pub type StatusClassifier = fn(StatusCode) -> FailureType;

/// Classifier deciding how a transport error should be treated.
pub type ErrorClassifier = fn(&TransportError) -> FailureType;

/// Configuration for retry behavior with capped exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 3 (so at most 4 attempts)
/// - `base_delay`: 500 milliseconds
/// - `max_delay`: 30 seconds
/// - `backoff_multiplier`: 2.0
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay) + jitter
/// ```
///
/// Jitter is at most half of `base_delay`, so a zero base delay means no
/// sleeping at all.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt.
    max_retries: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt (typically 2.0 for doubling).
    backoff_multiplier: f32,

    /// Decides whether a response status is retryable.
    status_classifier: StatusClassifier,

    /// Decides whether a transport error is retryable.
    error_classifier: ErrorClassifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            status_classifier: classify_status,
            error_classifier: classify_transport_error,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy allowing `max_retries` retries after the first attempt.
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Creates a policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(0)
    }

    /// Replaces the backoff parameters.
    ///
    /// Multipliers below 1.0 are raised to 1.0 so delays never shrink.
    #[must_use]
    pub fn with_backoff(
        mut self,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self.backoff_multiplier = backoff_multiplier.max(1.0);
        self
    }

    /// Disables the inter-attempt delay entirely.
    #[must_use]
    pub fn without_delay(self) -> Self {
        self.with_backoff(Duration::ZERO, Duration::ZERO, 1.0)
    }

    /// Replaces the status classifier.
    #[must_use]
    pub fn with_status_classifier(mut self, classifier: StatusClassifier) -> Self {
        self.status_classifier = classifier;
        self
    }

    /// Replaces the transport error classifier.
    #[must_use]
    pub fn with_error_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.error_classifier = classifier;
        self
    }

    /// Returns the number of retries allowed after the first attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the maximum number of attempts, including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Classifies a response status with the configured classifier.
    #[must_use]
    pub fn classify_status(&self, status: StatusCode) -> FailureType {
        (self.status_classifier)(status)
    }

    /// Classifies a transport error with the configured classifier.
    #[must_use]
    pub fn classify_error(&self, error: &TransportError) -> FailureType {
        (self.error_classifier)(error)
    }

    /// Determines whether to retry a failed attempt.
    ///
    /// # Arguments
    ///
    /// * `failure_type` - Classification of the failure
    /// * `attempt` - The attempt number that just failed (1-indexed)
    #[instrument(level = "debug", skip(self), fields(max_retries = self.max_retries))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if !failure_type.is_retryable() {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts() {
            debug!(attempt, max = self.max_attempts(), "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("retry budget ({}) exhausted", self.max_retries),
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

    /// Calculates the delay for a retry attempt with exponential backoff and jitter.
    ///
    /// Formula: `min(base_delay * multiplier^(attempt - 1), max_delay) + jitter`
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);

        // attempt 1 = multiplier^0 = 1x base
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * multiplier.powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    /// Generates random jitter between 0 and half the base delay.
    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        let max_jitter_ms = (self.base_delay.as_millis() / 2) as u64;
        if max_jitter_ms == 0 {
            return Duration::ZERO;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter_ms);
        Duration::from_millis(jitter_ms)
    }
}

/// Default status classification.
///
/// # HTTP Status Code Classification
///
/// | Status | Type | Rationale |
/// |--------|------|-----------|
/// | 1xx-3xx | Permanent | Not a failure, returned as-is |
/// | 408 | Transient | Request timeout - may succeed |
/// | 429 | RateLimited | Rate limited - retry with backoff |
/// | other 4xx | Permanent | Client error - won't succeed on retry |
/// | 5xx | Transient | Server error - may be temporary |
#[allow(clippy::match_same_arms)]
#[must_use]
pub fn classify_status(status: StatusCode) -> FailureType {
    match status.as_u16() {
        408 => FailureType::Transient,   // Request Timeout
        429 => FailureType::RateLimited, // Too Many Requests
        code if (500..600).contains(&code) => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

/// Default transport error classification: temporary errors are transient.
#[must_use]
pub fn classify_transport_error(error: &TransportError) -> FailureType {
    if error.is_temporary() {
        FailureType::Transient
    } else {
        FailureType::Permanent
    }
}
