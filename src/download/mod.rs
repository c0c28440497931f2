//! Retrying sends and concurrent, order-preserving downloads.
//!
//! This module layers three pieces on top of an abstract [`Transport`]:
//!
//! - [`RetryingSender`] retries transient transport errors and retryable
//!   statuses according to a [`RetryPolicy`]
//! - [`ConcurrencyLimiter`] caps how many units of work run at once
//! - [`Downloader`] fetches many sources through both and delivers the
//!   bodies to a directory, a writer or a single file
//!
//! # Example
//!
//! ```no_run
//! use fetchkit_core::download::{DownloadSource, Downloader, DownloaderOptions};
//! use std::path::Path;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let downloader = Downloader::new(reqwest::Client::new(), DownloaderOptions::default())?;
//! downloader
//!     .download_in_directory(
//!         &CancellationToken::new(),
//!         Path::new("./downloads"),
//!         &[DownloadSource::new("https://example.com/paper.pdf")],
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod downloader;
mod error;
mod filename;
pub mod limiter;
mod retry;
mod sender;

pub use downloader::{DownloadSource, Downloader, DownloaderOptions};
pub use error::{DownloadError, LimiterError, SendError, TransportError};
pub use limiter::{ConcurrencyLimiter, DEFAULT_CONCURRENCY, Permit};
pub use retry::{
    DEFAULT_MAX_RETRIES, ErrorClassifier, FailureType, RetryDecision, RetryPolicy,
    StatusClassifier, classify_status, classify_transport_error,
};
pub use sender::{RetryingSender, SenderOptions, Transport};

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
