//! Error types for the download module.
//!
//! Errors are layered the same way the components are: a [`TransportError`]
//! comes out of a single request execution, a [`SendError`] out of a
//! retrying send, a [`LimiterError`] out of permit acquisition, and a
//! [`DownloadError`] out of a multi-source download.

use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

/// Errors produced by a single execution of a request by a [`Transport`].
///
/// [`Transport`]: super::Transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request did not complete before its deadline.
    #[error("timeout requesting {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// The connection could not be established (DNS, refused, reset).
    #[error("connection to {url} failed: {message}")]
    Connect {
        /// The URL that could not be reached.
        url: String,
        /// Description of the failure.
        message: String,
    },

    /// A network failure the transport explicitly marked as temporary.
    #[error("temporary network error requesting {url}: {message}")]
    Temporary {
        /// The URL being requested.
        url: String,
        /// Description of the failure.
        message: String,
    },

    /// Any other request failure reported by the HTTP client.
    #[error("request to {url} failed: {source}")]
    Request {
        /// The URL being requested.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// A failure that will not go away on its own.
    #[error("request to {url} failed permanently: {message}")]
    Permanent {
        /// The URL being requested.
        url: String,
        /// Description of the failure.
        message: String,
    },
}

impl TransportError {
    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a connection error.
    pub fn connect(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connect {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates an error explicitly marked temporary.
    pub fn temporary(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Temporary {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates a permanent error.
    pub fn permanent(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Maps a reqwest error onto the transport taxonomy.
    ///
    /// Timeouts and connect failures keep their own variants so they classify
    /// as temporary; everything else keeps the reqwest error as its source.
    pub fn from_reqwest(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else if source.is_connect() {
            Self::Connect {
                url,
                message: source.to_string(),
            }
        } else {
            Self::Request { url, source }
        }
    }

    /// Whether the failure is expected to clear up on its own.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Connect { .. } | Self::Temporary { .. } => true,
            Self::Request { source, .. } => source.is_timeout() || source.is_connect(),
            Self::Permanent { .. } => false,
        }
    }
}

/// Errors produced by [`RetryingSender`](super::RetryingSender).
#[derive(Debug, Error)]
pub enum SendError {
    /// The last attempt failed at the transport level.
    #[error("sending {url} failed after {attempts} attempt(s): {source}")]
    Transport {
        /// The URL being sent.
        url: String,
        /// Number of attempts made, including the first.
        attempts: u32,
        /// The last transport error observed.
        #[source]
        source: TransportError,
    },

    /// Every attempt returned a retryable status and the budget ran out.
    #[error("sending {url} failed after {attempts} attempt(s): last status {status}")]
    Exhausted {
        /// The URL being sent.
        url: String,
        /// Number of attempts made, including the first.
        attempts: u32,
        /// Status of the last response, which was discarded.
        status: StatusCode,
    },

    /// The send was cancelled before it could complete.
    #[error("sending {url} was cancelled")]
    Cancelled {
        /// The URL being sent.
        url: String,
    },
}

impl SendError {
    /// Number of attempts made before the error surfaced (0 when cancelled).
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Transport { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
            Self::Cancelled { .. } => 0,
        }
    }

    /// Whether the error is a cancellation rather than a send failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Errors produced by [`ConcurrencyLimiter`](super::ConcurrencyLimiter).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimiterError {
    /// Invalid concurrency value provided.
    #[error("invalid concurrency value {value}: must be between {min} and {max}")]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
        /// Smallest accepted value.
        min: usize,
        /// Largest accepted value.
        max: usize,
    },

    /// The waiting caller was cancelled before a permit became available.
    #[error("permit acquisition cancelled")]
    Cancelled,

    /// The limiter was closed.
    #[error("limiter closed")]
    Closed,
}

/// Errors that can occur during a multi-source download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The downloader was closed before the call.
    #[error("downloader is closed")]
    Closed,

    /// The caller cancelled the operation.
    #[error("download cancelled")]
    Cancelled,

    /// Sending the request for a source failed after retries.
    #[error("source #{index} ({url}): {source}")]
    Send {
        /// Position of the source in the original list.
        index: usize,
        /// The source URL.
        url: String,
        /// The underlying send error.
        #[source]
        source: SendError,
    },

    /// The final response for a source had a non-success status.
    #[error("source #{index} ({url}): unexpected HTTP status {status}")]
    Status {
        /// Position of the source in the original list.
        index: usize,
        /// The source URL.
        url: String,
        /// The status code returned.
        status: StatusCode,
    },

    /// Reading a response body failed.
    #[error("source #{index} ({url}): reading body failed: {source}")]
    Body {
        /// Position of the source in the original list.
        index: usize,
        /// The source URL.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// Two sources resolved to the same file in directory mode.
    #[error("sources #{first} and #{second} both write to {name}")]
    DuplicateDestination {
        /// The shared destination name.
        name: String,
        /// Index of the first source using the name.
        first: usize,
        /// Index of the second source using the name.
        second: usize,
    },

    /// The source URL could not be parsed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// File system error while writing a destination.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Writing to the destination stream failed.
    #[error("writing to destination failed: {0}")]
    Write(#[source] std::io::Error),

    /// A download task panicked.
    #[error("download task failed: {0}")]
    Task(String),

    /// The downloader options were rejected.
    #[error("invalid downloader configuration: {0}")]
    Config(#[source] LimiterError),
}

impl DownloadError {
    /// Creates a send error for the source at `index`.
    pub fn send(index: usize, url: impl Into<String>, source: SendError) -> Self {
        Self::Send {
            index,
            url: url.into(),
            source,
        }
    }

    /// Creates a status error for the source at `index`.
    pub fn status(index: usize, url: impl Into<String>, status: StatusCode) -> Self {
        Self::Status {
            index,
            url: url.into(),
            status,
        }
    }

    /// Creates a body read error for the source at `index`.
    pub fn body(index: usize, url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Body {
            index,
            url: url.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error reports a cancellation rather than a failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Send { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

impl From<LimiterError> for DownloadError {
    fn from(error: LimiterError) -> Self {
        match error {
            LimiterError::Closed => Self::Closed,
            LimiterError::Cancelled => Self::Cancelled,
            invalid @ LimiterError::InvalidConcurrency { .. } => Self::Config(invalid),
        }
    }
}

// Helper constructors are used instead of `From<std::io::Error>` and
// `From<reqwest::Error>` because every variant needs a URL, path or index
// that the source error does not carry.

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_temporary_classification() {
        assert!(TransportError::timeout("http://example.com").is_temporary());
        assert!(TransportError::connect("http://example.com", "refused").is_temporary());
        assert!(TransportError::temporary("http://example.com", "reset").is_temporary());
        assert!(!TransportError::permanent("http://example.com", "bad scheme").is_temporary());
    }

    #[test]
    fn test_transport_error_display_includes_url() {
        let error = TransportError::connect("http://example.com/a", "refused");
        let msg = error.to_string();
        assert!(msg.contains("http://example.com/a"), "Expected URL in: {msg}");
        assert!(msg.contains("refused"), "Expected message in: {msg}");
    }

    #[test]
    fn test_send_error_exhausted_display() {
        let error = SendError::Exhausted {
            url: "http://example.com/file".to_string(),
            attempts: 4,
            status: StatusCode::INTERNAL_SERVER_ERROR,
        };
        let msg = error.to_string();
        assert!(msg.contains("4 attempt"), "Expected attempts in: {msg}");
        assert!(msg.contains("500"), "Expected status in: {msg}");
        assert_eq!(error.attempts(), 4);
        assert!(!error.is_cancelled());
    }

    #[test]
    fn test_send_error_cancelled() {
        let error = SendError::Cancelled {
            url: "http://example.com".to_string(),
        };
        assert!(error.is_cancelled());
        assert_eq!(error.attempts(), 0);
    }

    #[test]
    fn test_limiter_error_display() {
        let error = LimiterError::InvalidConcurrency {
            value: 0,
            min: 1,
            max: 100,
        };
        let msg = error.to_string();
        assert!(msg.contains("invalid concurrency"));
        assert!(msg.contains('0'));
        assert!(msg.contains("100"));
    }

    #[test]
    fn test_download_error_from_limiter_error() {
        assert!(matches!(
            DownloadError::from(LimiterError::Closed),
            DownloadError::Closed
        ));
        assert!(matches!(
            DownloadError::from(LimiterError::Cancelled),
            DownloadError::Cancelled
        ));
    }

    #[test]
    fn test_download_error_cancellation_is_distinct() {
        assert!(DownloadError::Cancelled.is_cancelled());
        let cancelled_send = DownloadError::send(
            2,
            "http://example.com",
            SendError::Cancelled {
                url: "http://example.com".to_string(),
            },
        );
        assert!(cancelled_send.is_cancelled());
        let status = DownloadError::status(1, "http://example.com", StatusCode::NOT_FOUND);
        assert!(!status.is_cancelled());
    }

    #[test]
    fn test_download_error_status_display() {
        let error = DownloadError::status(3, "http://example.com/x", StatusCode::NOT_FOUND);
        let msg = error.to_string();
        assert!(msg.contains("#3"), "Expected index in: {msg}");
        assert!(msg.contains("404"), "Expected status in: {msg}");
    }

    #[test]
    fn test_download_error_io_display() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let error = DownloadError::io(PathBuf::from("/tmp/test.bin"), io_error);
        let msg = error.to_string();
        assert!(msg.contains("/tmp/test.bin"), "Expected path in: {msg}");
    }
}
