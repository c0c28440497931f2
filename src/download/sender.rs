//! Retrying HTTP sender.
//!
//! [`RetryingSender`] wraps any [`Transport`] and applies a [`RetryPolicy`]
//! around every send: transient transport errors and retryable statuses are
//! retried until the budget runs out, everything else is returned as-is.
//!
//! # Example
//!
//! ```no_run
//! use fetchkit_core::download::{RetryPolicy, RetryingSender, SenderOptions};
//! use reqwest::{Method, Request, Url};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sender = RetryingSender::new(
//!     reqwest::Client::new(),
//!     SenderOptions {
//!         policy: RetryPolicy::new(3),
//!         ..SenderOptions::default()
//!     },
//! );
//! let request = Request::new(Method::GET, Url::parse("https://example.com/file")?);
//! let response = sender.send(request).await?;
//! println!("status: {}", response.status());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::retry::{RetryDecision, RetryPolicy};
use super::{SendError, TransportError};

/// Executes a single HTTP request.
///
/// This is the only capability the sender needs; [`reqwest::Client`]
/// implements it, and tests plug in canned responses.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` once and returns the server's response.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when no response was obtained.
    async fn execute(&self, request: Request) -> Result<Response, TransportError>;
}

#[async_trait]
impl Transport for reqwest::Client {
    async fn execute(&self, request: Request) -> Result<Response, TransportError> {
        let url = request.url().to_string();
        reqwest::Client::execute(self, request)
            .await
            .map_err(|e| TransportError::from_reqwest(url, e))
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn execute(&self, request: Request) -> Result<Response, TransportError> {
        (**self).execute(request).await
    }
}

/// Configuration for [`RetryingSender`].
#[derive(Debug, Clone, Default)]
pub struct SenderOptions {
    /// Retry budget, backoff and classification.
    pub policy: RetryPolicy,
    /// Per-attempt timeout applied to requests that don't carry one.
    pub timeout: Option<Duration>,
}

/// Sends requests through a [`Transport`], retrying transient failures.
///
/// Attempt counters are local to each call, so one sender can serve many
/// concurrent sends.
pub struct RetryingSender {
    transport: Arc<dyn Transport>,
    options: SenderOptions,
}

impl std::fmt::Debug for RetryingSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingSender")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Failed outcome of one attempt.
enum Retryable {
    Status(reqwest::StatusCode),
    Transport(TransportError),
}

impl Retryable {
    fn into_error(self, url: String, attempts: u32) -> SendError {
        match self {
            Self::Status(status) => SendError::Exhausted {
                url,
                attempts,
                status,
            },
            Self::Transport(source) => SendError::Transport {
                url,
                attempts,
                source,
            },
        }
    }
}

impl std::fmt::Display for Retryable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status(status) => write!(f, "HTTP {status}"),
            Self::Transport(error) => write!(f, "{error}"),
        }
    }
}

impl RetryingSender {
    /// Creates a sender over `transport`.
    pub fn new(transport: impl Transport + 'static, options: SenderOptions) -> Self {
        Self {
            transport: Arc::new(transport),
            options,
        }
    }

    /// Returns the configured retry policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.options.policy
    }

    /// Sends `request`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// See [`send_with_cancellation`](Self::send_with_cancellation).
    pub async fn send(&self, request: Request) -> Result<Response, SendError> {
        self.send_with_cancellation(&CancellationToken::new(), request)
            .await
    }

    /// Sends `request`, retrying transient failures, until `cancel` fires.
    ///
    /// A response whose status is not retryable is returned without error,
    /// whatever its status. The body of a discarded response is dropped
    /// before the next attempt.
    ///
    /// # Errors
    ///
    /// - [`SendError::Transport`] for a non-retryable transport error, or a
    ///   retryable one once the budget is spent
    /// - [`SendError::Exhausted`] when the last allowed attempt still returned
    ///   a retryable status
    /// - [`SendError::Cancelled`] if `cancel` fires first
    #[instrument(skip_all, fields(method = %request.method(), url = %request.url()))]
    pub async fn send_with_cancellation(
        &self,
        cancel: &CancellationToken,
        mut request: Request,
    ) -> Result<Response, SendError> {
        let url = request.url().to_string();
        let policy = &self.options.policy;

        if request.timeout().is_none() {
            *request.timeout_mut() = self.options.timeout;
        }

        let mut attempt = 0u32;
        let mut previous_delay = Duration::ZERO;
        let mut current = request;

        loop {
            attempt += 1;
            // Keep a copy for the next attempt; streaming bodies can't be copied.
            let spare = current.try_clone();

            debug!(attempt, "sending request");

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(SendError::Cancelled { url }),
                outcome = self.transport.execute(current) => outcome,
            };

            let (failure, retryable) = match outcome {
                Ok(response) => {
                    let status = response.status();
                    let failure = policy.classify_status(status);
                    if !failure.is_retryable() {
                        debug!(attempt, %status, "received final response");
                        return Ok(response);
                    }
                    // Dropping the response releases its connection.
                    drop(response);
                    (failure, Retryable::Status(status))
                }
                Err(error) => (policy.classify_error(&error), Retryable::Transport(error)),
            };

            current = match (spare, policy.should_retry(failure, attempt)) {
                (
                    Some(next),
                    RetryDecision::Retry {
                        delay: backoff,
                        attempt: next_attempt,
                    },
                ) => {
                    let delay = backoff.max(previous_delay);
                    previous_delay = delay;
                    info!(
                        url = %url,
                        attempt = next_attempt,
                        retries_left = policy.max_attempts() - attempt,
                        delay_ms = delay.as_millis(),
                        cause = %retryable,
                        "send failed, retrying"
                    );

                    if !delay.is_zero() {
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => return Err(SendError::Cancelled { url }),
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                    next
                }
                (_, RetryDecision::DoNotRetry { reason }) => {
                    debug!(attempt, %reason, "not retrying");
                    return Err(retryable.into_error(url, attempt));
                }
                (None, RetryDecision::Retry { .. }) => {
                    warn!(attempt, "request body cannot be replayed, not retrying");
                    return Err(retryable.into_error(url, attempt));
                }
            };
        }
    }
}
