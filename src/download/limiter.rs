//! Bounded concurrency limiter.
//!
//! [`ConcurrencyLimiter`] caps the number of units of work running at the
//! same time. It is a thin wrapper around a Tokio [`Semaphore`]: the permit
//! count is only ever changed by [`ConcurrencyLimiter::acquire`] and by
//! dropping (or explicitly releasing) the returned [`Permit`].
//!
//! # Example
//!
//! ```
//! use fetchkit_core::download::ConcurrencyLimiter;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = ConcurrencyLimiter::new(2)?;
//! let cancel = CancellationToken::new();
//!
//! let permit = limiter.acquire(&cancel).await?;
//! assert_eq!(limiter.available(), 1);
//! permit.release();
//! assert_eq!(limiter.available(), 2);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::LimiterError;

/// Minimum allowed concurrency value.
pub const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
pub const MAX_CONCURRENCY: usize = 100;

/// Default concurrency if not specified.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Caps how many permits may be held at once.
///
/// Cloning is cheap and every clone shares the same permit pool, so the
/// limiter can be handed to spawned tasks.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max: usize,
}

/// A slot granted by [`ConcurrencyLimiter::acquire`].
///
/// The slot returns to the limiter when the permit is dropped, so it is
/// released on every exit path of the task holding it.
#[derive(Debug)]
#[must_use = "dropping a permit releases its slot immediately"]
pub struct Permit {
    _inner: OwnedSemaphorePermit,
}

impl Permit {
    /// Returns the slot to the limiter.
    ///
    /// Equivalent to dropping the permit; consuming `self` makes a second
    /// release impossible.
    pub fn release(self) {}
}

impl ConcurrencyLimiter {
    /// Creates a limiter admitting at most `max` concurrent permits.
    ///
    /// # Errors
    ///
    /// Returns [`LimiterError::InvalidConcurrency`] if `max` is outside
    /// [`MIN_CONCURRENCY`]..=[`MAX_CONCURRENCY`].
    pub fn new(max: usize) -> Result<Self, LimiterError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&max) {
            return Err(LimiterError::InvalidConcurrency {
                value: max,
                min: MIN_CONCURRENCY,
                max: MAX_CONCURRENCY,
            });
        }

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        })
    }

    /// Returns the configured maximum.
    #[must_use]
    pub fn max(&self) -> usize {
        self.max
    }

    /// Returns the number of permits that could be acquired right now.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Returns the number of permits currently held.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.max.saturating_sub(self.available())
    }

    /// Waits for a free slot.
    ///
    /// Cancellation wins over a permit that becomes available at the same
    /// moment, so a cancelled caller never walks away holding a slot.
    ///
    /// # Errors
    ///
    /// - [`LimiterError::Cancelled`] if `cancel` fires while waiting
    /// - [`LimiterError::Closed`] if the limiter was closed
    #[instrument(level = "trace", skip_all, fields(max = self.max))]
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Permit, LimiterError> {
        if cancel.is_cancelled() {
            return Err(LimiterError::Cancelled);
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("permit acquisition cancelled");
                Err(LimiterError::Cancelled)
            }
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit
                    .map(|inner| Permit { _inner: inner })
                    .map_err(|_| LimiterError::Closed)
            }
        }
    }

    /// Closes the limiter.
    ///
    /// Pending and future [`acquire`](Self::acquire) calls fail with
    /// [`LimiterError::Closed`]; permits already handed out stay valid until
    /// dropped.
    pub fn close(&self) {
        debug!(max = self.max, "closing concurrency limiter");
        self.semaphore.close();
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}
