//! Fetchkit Core Library
//!
//! Client-side networking building blocks: a retrying HTTP sender, a bounded
//! concurrency limiter, an order-preserving multi-source downloader, and an
//! HTTP server whose shutdown is driven by a shared lifecycle.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`lifecycle`] - Stop signalling and wait-for-dependents coordination
//! - [`download`] - Retrying sends, concurrency limiting and ordered downloads
//! - [`server`] - Lifecycle-bound HTTP listener

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod download;
pub mod lifecycle;
pub mod server;

// Re-export commonly used types
pub use download::{
    ConcurrencyLimiter, DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, DownloadError, DownloadSource,
    Downloader, DownloaderOptions, FailureType, RetryDecision, RetryPolicy, RetryingSender,
    SendError, SenderOptions, Transport,
};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use server::{ServeOptions, ServerError, ServerHandle, ServerState, serve, serve_listener};
