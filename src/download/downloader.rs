//! Concurrent, order-preserving multi-source downloader.
//!
//! [`Downloader`] fetches a list of [`DownloadSource`]s in parallel through a
//! [`RetryingSender`], never running more than the configured number of
//! fetches at once, and delivers the bodies to a directory, a writer or a
//! single file.
//!
//! # Concurrency Model
//!
//! - A limiter permit is acquired before each fetch task is spawned
//! - Permits are released automatically when a task ends (RAII)
//! - Each task stores its result in the slot matching its source index
//! - The first failure cancels the operation token shared by all tasks, so
//!   queued sources are never started and in-flight ones stop at their next
//!   await point
//!
//! # Ordering
//!
//! Writer and file delivery only touch the destination once every source has
//! succeeded, then write the slots sequentially. The output is byte-for-byte
//! the concatenation of the bodies in source order no matter which fetch
//! finished first, and nothing is written when any source fails.
//!
//! # Example
//!
//! ```no_run
//! use fetchkit_core::download::{DownloadSource, Downloader, DownloaderOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let downloader = Downloader::new(reqwest::Client::new(), DownloaderOptions::default())?;
//! let mut out = Vec::new();
//! downloader
//!     .download_in_writer(
//!         &CancellationToken::new(),
//!         &mut out,
//!         &[
//!             DownloadSource::new("https://example.com/part1"),
//!             DownloadSource::new("https://example.com/part2"),
//!         ],
//!     )
//!     .await?;
//! downloader.close();
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Request, Response, Url};
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::filename::destination_name;
use super::limiter::{ConcurrencyLimiter, DEFAULT_CONCURRENCY};
use super::sender::{RetryingSender, SenderOptions, Transport};
use super::DownloadError;

/// Upper bound on the body buffer reserved up front from `Content-Length`.
const MAX_PREALLOCATED_BODY: usize = 8 * 1024 * 1024;

/// One entry of a multi-source download.
#[derive(Debug, Clone)]
pub struct DownloadSource {
    /// Absolute URL to fetch.
    pub url: String,
    /// File name used in directory mode; derived from the URL when absent.
    pub name: Option<String>,
    /// HTTP method, GET unless overridden.
    pub method: Method,
    /// Extra request headers.
    pub headers: HeaderMap,
}

impl DownloadSource {
    /// Creates a GET source for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
            method: Method::GET,
            headers: HeaderMap::new(),
        }
    }

    /// Sets the destination file name used in directory mode.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Overrides the HTTP method.
    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Adds a request header.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    fn to_request(&self) -> Result<Request, DownloadError> {
        let url = Url::parse(&self.url).map_err(|_| DownloadError::invalid_url(&self.url))?;
        let mut request = Request::new(self.method.clone(), url);
        request.headers_mut().extend(self.headers.clone());
        Ok(request)
    }
}

impl From<&str> for DownloadSource {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for DownloadSource {
    fn from(url: String) -> Self {
        Self::new(url)
    }
}

/// Configuration for [`Downloader`].
#[derive(Debug, Clone)]
pub struct DownloaderOptions {
    /// Maximum number of sources fetched at the same time.
    pub concurrency: usize,
    /// Retry and timeout settings for each fetch.
    pub sender: SenderOptions,
}

impl Default for DownloaderOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            sender: SenderOptions::default(),
        }
    }
}

/// Fetches many sources concurrently and delivers them in source order.
///
/// The downloader owns its limiter; [`close`](Self::close) releases it and
/// every later download call fails with [`DownloadError::Closed`].
#[derive(Debug)]
pub struct Downloader {
    sender: Arc<RetryingSender>,
    limiter: ConcurrencyLimiter,
}

impl Downloader {
    /// Creates a downloader sending through `transport`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Config`] if the concurrency is out of range.
    #[instrument(level = "debug", skip(transport, options), fields(concurrency = options.concurrency))]
    pub fn new(
        transport: impl Transport + 'static,
        options: DownloaderOptions,
    ) -> Result<Self, DownloadError> {
        let limiter = ConcurrencyLimiter::new(options.concurrency).map_err(DownloadError::Config)?;

        debug!(
            concurrency = options.concurrency,
            max_retries = options.sender.policy.max_retries(),
            "creating downloader"
        );

        Ok(Self {
            sender: Arc::new(RetryingSender::new(transport, options.sender)),
            limiter,
        })
    }

    /// Returns the configured concurrency limit.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.limiter.max()
    }

    /// Releases the limiter. Downloads started afterwards fail with
    /// [`DownloadError::Closed`].
    pub fn close(&self) {
        if !self.limiter.is_closed() {
            info!("closing downloader");
        }
        self.limiter.close();
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.limiter.is_closed()
    }

    /// Downloads every source into its own file inside `dir`.
    ///
    /// Files are named by [`DownloadSource::name`], or by the last URL path
    /// segment. `dir` is created if missing. Files of sources that completed
    /// before a failure are left in place; the failing source's partial
    /// file is removed.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::Closed`] after [`close`](Self::close)
    /// - [`DownloadError::Cancelled`] if `cancel` fires
    /// - [`DownloadError::DuplicateDestination`] if two sources share a name
    /// - the first per-source failure otherwise
    #[instrument(skip_all, fields(dir = %dir.display(), sources = sources.len()))]
    pub async fn download_in_directory(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
        sources: &[DownloadSource],
    ) -> Result<(), DownloadError> {
        self.ensure_open()?;
        if sources.is_empty() {
            return Ok(());
        }

        let mut paths = Vec::with_capacity(sources.len());
        let mut seen: HashMap<String, usize> = HashMap::new();
        for (index, source) in sources.iter().enumerate() {
            let name = destination_name(source.name.as_deref(), &source.url, index);
            if let Some(&first) = seen.get(&name) {
                return Err(DownloadError::DuplicateDestination {
                    name,
                    first,
                    second: index,
                });
            }
            seen.insert(name.clone(), index);
            paths.push(dir.join(name));
        }

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| DownloadError::io(dir, e))?;

        let paths = Arc::new(paths);
        let written = self
            .fetch_all(cancel, sources, move |index, source, response, cancel| {
                let paths = Arc::clone(&paths);
                async move {
                    let path = &paths[index];
                    write_body_to_file(response, path, &cancel, index, &source.url).await
                }
            })
            .await?;

        info!(
            files = written.len(),
            bytes = written.iter().sum::<u64>(),
            "directory download complete"
        );
        Ok(())
    }

    /// Downloads every source and writes the bodies to `writer` in source order.
    ///
    /// Nothing is written unless every source succeeds.
    ///
    /// # Errors
    ///
    /// Same as [`download_in_directory`](Self::download_in_directory), plus
    /// [`DownloadError::Write`] if writing to `writer` fails.
    #[instrument(skip_all, fields(sources = sources.len()))]
    pub async fn download_in_writer<W>(
        &self,
        cancel: &CancellationToken,
        writer: &mut W,
        sources: &[DownloadSource],
    ) -> Result<(), DownloadError>
    where
        W: AsyncWrite + Unpin,
    {
        let bodies = self.fetch_bodies(cancel, sources).await?;
        let bytes = write_in_order(writer, &bodies, cancel)
            .await
            .map_err(|e| match e {
                WriteFailure::Cancelled => DownloadError::Cancelled,
                WriteFailure::Io(source) => DownloadError::Write(source),
            })?;

        info!(bytes, "writer download complete");
        Ok(())
    }

    /// Downloads every source and concatenates the bodies into the file at `path`.
    ///
    /// The file is only created once every source has succeeded.
    ///
    /// # Errors
    ///
    /// Same as [`download_in_writer`](Self::download_in_writer), with file
    /// errors reported as [`DownloadError::Io`].
    #[instrument(skip_all, fields(path = %path.display(), sources = sources.len()))]
    pub async fn download_in_file(
        &self,
        cancel: &CancellationToken,
        path: &Path,
        sources: &[DownloadSource],
    ) -> Result<(), DownloadError> {
        let bodies = self.fetch_bodies(cancel, sources).await?;

        let file = File::create(path)
            .await
            .map_err(|e| DownloadError::io(path, e))?;
        let mut writer = BufWriter::new(file);

        let bytes = match write_in_order(&mut writer, &bodies, cancel).await {
            Ok(bytes) => bytes,
            Err(failure) => {
                drop(writer);
                remove_partial_file(path).await;
                return Err(match failure {
                    WriteFailure::Cancelled => DownloadError::Cancelled,
                    WriteFailure::Io(source) => DownloadError::io(path, source),
                });
            }
        };

        info!(bytes, "file download complete");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), DownloadError> {
        if self.limiter.is_closed() {
            return Err(DownloadError::Closed);
        }
        Ok(())
    }

    async fn fetch_bodies(
        &self,
        cancel: &CancellationToken,
        sources: &[DownloadSource],
    ) -> Result<Vec<Bytes>, DownloadError> {
        self.ensure_open()?;
        if sources.is_empty() {
            return Ok(Vec::new());
        }

        self.fetch_all(cancel, sources, |index, source, response, cancel| async move {
            read_body(response, &cancel, index, &source.url).await
        })
        .await
    }

    /// Fetches all sources under the limiter and hands each successful
    /// response to `deliver`. Results come back indexed by source position.
    async fn fetch_all<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        sources: &[DownloadSource],
        deliver: F,
    ) -> Result<Vec<T>, DownloadError>
    where
        T: Send + 'static,
        F: Fn(usize, DownloadSource, Response, CancellationToken) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<T, DownloadError>> + Send + 'static,
    {
        let operation = cancel.child_token();
        let mut slots: Vec<Option<T>> = sources.iter().map(|_| None).collect();
        let mut failure = FirstFailure::default();
        let mut tasks = JoinSet::new();

        for (index, source) in sources.iter().enumerate() {
            let permit = match self.limiter.acquire(&operation).await {
                Ok(permit) => permit,
                Err(e) => {
                    operation.cancel();
                    failure.record(e.into());
                    break;
                }
            };

            let sender = Arc::clone(&self.sender);
            let operation = operation.clone();
            let deliver = deliver.clone();
            let source = source.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let result = fetch_one(&sender, &operation, index, source, deliver).await;
                if result.is_err() {
                    // Stop queued and in-flight work as soon as one source fails.
                    operation.cancel();
                }
                (index, result)
            });
        }

        debug!(task_count = tasks.len(), "waiting for fetches to complete");

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(value))) => slots[index] = Some(value),
                Ok((index, Err(e))) => {
                    if !e.is_cancelled() {
                        warn!(index, error = %e, "source failed");
                    }
                    failure.record(e);
                }
                Err(e) => {
                    warn!(error = %e, "download task panicked");
                    operation.cancel();
                    failure.record(DownloadError::Task(e.to_string()));
                }
            }
        }

        if let Some(error) = failure.into_error() {
            return Err(error);
        }
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        slots
            .into_iter()
            .collect::<Option<Vec<T>>>()
            .ok_or_else(|| DownloadError::Task("a source finished without a result".to_string()))
    }
}

/// Keeps the first real failure, preferring it over cancellations it caused.
#[derive(Default)]
struct FirstFailure(Option<DownloadError>);

impl FirstFailure {
    fn record(&mut self, error: DownloadError) {
        match &self.0 {
            None => self.0 = Some(error),
            Some(existing) if existing.is_cancelled() && !error.is_cancelled() => {
                self.0 = Some(error);
            }
            Some(_) => {}
        }
    }

    fn into_error(self) -> Option<DownloadError> {
        self.0.map(|error| {
            if error.is_cancelled() {
                DownloadError::Cancelled
            } else {
                error
            }
        })
    }
}

async fn fetch_one<T, F, Fut>(
    sender: &RetryingSender,
    cancel: &CancellationToken,
    index: usize,
    source: DownloadSource,
    deliver: F,
) -> Result<T, DownloadError>
where
    F: Fn(usize, DownloadSource, Response, CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, DownloadError>>,
{
    let request = source.to_request()?;
    debug!(index, url = %source.url, "fetching source");

    let response = sender
        .send_with_cancellation(cancel, request)
        .await
        .map_err(|e| DownloadError::send(index, &source.url, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::status(index, &source.url, status));
    }

    deliver(index, source, response, cancel.clone()).await
}

/// Reads a whole response body, stopping early if `cancel` fires.
async fn read_body(
    response: Response,
    cancel: &CancellationToken,
    index: usize,
    url: &str,
) -> Result<Bytes, DownloadError> {
    // Content-Length is only a hint from the server; never trust it for the allocation size.
    let mut buffer = BytesMut::with_capacity(
        response
            .content_length()
            .and_then(|len| usize::try_from(len).ok())
            .unwrap_or_default()
            .min(MAX_PREALLOCATED_BODY),
    );
    let mut stream = response.bytes_stream();

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DownloadError::Cancelled),
            next = stream.next() => next,
        };
        match next {
            Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
            Some(Err(e)) => return Err(DownloadError::body(index, url, e)),
            None => break,
        }
    }

    debug!(index, bytes = buffer.len(), "body buffered");
    Ok(buffer.freeze())
}

/// Streams a response body to `path`, removing the file on failure.
async fn write_body_to_file(
    response: Response,
    path: &Path,
    cancel: &CancellationToken,
    index: usize,
    url: &str,
) -> Result<u64, DownloadError> {
    let file = File::create(path)
        .await
        .map_err(|e| DownloadError::io(path, e))?;

    let result = stream_to_writer(response, BufWriter::new(file), path, cancel, index, url).await;
    if result.is_err() {
        remove_partial_file(path).await;
    } else {
        debug!(index, path = %path.display(), "source written");
    }
    result
}

async fn stream_to_writer(
    response: Response,
    mut writer: BufWriter<File>,
    path: &Path,
    cancel: &CancellationToken,
    index: usize,
    url: &str,
) -> Result<u64, DownloadError> {
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DownloadError::Cancelled),
            next = stream.next() => next,
        };
        let chunk = match next {
            Some(chunk) => chunk.map_err(|e| DownloadError::body(index, url, e))?,
            None => break,
        };

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(path, e))?;
        bytes_written += chunk.len() as u64;
    }

    // Ensure all data is flushed to disk
    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(path, e))?;

    Ok(bytes_written)
}

enum WriteFailure {
    Cancelled,
    Io(std::io::Error),
}

/// Writes `bodies` to `writer` in order, checking `cancel` between bodies.
async fn write_in_order<W>(
    writer: &mut W,
    bodies: &[Bytes],
    cancel: &CancellationToken,
) -> Result<u64, WriteFailure>
where
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    for body in bodies {
        if cancel.is_cancelled() {
            return Err(WriteFailure::Cancelled);
        }
        writer.write_all(body).await.map_err(WriteFailure::Io)?;
        total += body.len() as u64;
    }
    writer.flush().await.map_err(WriteFailure::Io)?;
    Ok(total)
}

async fn remove_partial_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), error = %e, "could not remove partial file");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::StatusCode;
    use tempfile::TempDir;

    use super::*;
    use crate::download::{RetryPolicy, TransportError};

    /// Serves each URL's path as its body, with per-path delays and statuses.
    struct PathEcho {
        delays: HashMap<String, Duration>,
        statuses: HashMap<String, u16>,
        broken: Vec<String>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl PathEcho {
        fn new() -> Self {
            Self {
                delays: HashMap::new(),
                statuses: HashMap::new(),
                broken: Vec::new(),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }

        fn delay(mut self, path: &str, delay: Duration) -> Self {
            self.delays.insert(path.to_string(), delay);
            self
        }

        fn status(mut self, path: &str, status: u16) -> Self {
            self.statuses.insert(path.to_string(), status);
            self
        }

        /// The body for `path` yields its first chunk, then fails.
        fn broken(mut self, path: &str) -> Self {
            self.broken.push(path.to_string());
            self
        }
    }

    #[async_trait]
    impl Transport for PathEcho {
        async fn execute(&self, request: Request) -> Result<Response, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let path = request.url().path().to_string();
            if let Some(delay) = self.delays.get(&path) {
                tokio::time::sleep(*delay).await;
            }
            let status = self.statuses.get(&path).copied().unwrap_or(200);

            let body = if self.broken.contains(&path) {
                reqwest::Body::wrap_stream(futures_util::stream::iter(vec![
                    Ok(Bytes::from(path)),
                    Err(std::io::Error::other("connection reset mid-body")),
                ]))
            } else {
                reqwest::Body::from(path)
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Response::from(
                http::Response::builder()
                    .status(status)
                    .body(body)
                    .unwrap(),
            ))
        }
    }

    fn downloader(transport: Arc<PathEcho>, concurrency: usize) -> Downloader {
        Downloader::new(
            transport,
            DownloaderOptions {
                concurrency,
                sender: SenderOptions {
                    policy: RetryPolicy::new(1).without_delay(),
                    timeout: None,
                },
            },
        )
        .unwrap()
    }

    fn sources(paths: &[&str]) -> Vec<DownloadSource> {
        paths
            .iter()
            .map(|path| DownloadSource::new(format!("http://example.com{path}")))
            .collect()
    }

    #[test]
    fn test_downloader_rejects_invalid_concurrency() {
        let result = Downloader::new(
            Arc::new(PathEcho::new()),
            DownloaderOptions {
                concurrency: 0,
                ..DownloaderOptions::default()
            },
        );
        assert!(matches!(result, Err(DownloadError::Config(_))));
    }

    #[test]
    fn test_source_to_request_keeps_method_and_headers() {
        let source = DownloadSource::new("http://example.com/a")
            .with_method(Method::POST)
            .with_header(
                reqwest::header::AUTHORIZATION,
                HeaderValue::from_static("Bearer x"),
            );
        let request = source.to_request().unwrap();
        assert_eq!(request.method(), &Method::POST);
        assert_eq!(
            request.headers().get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer x"
        );
    }

    #[tokio::test]
    async fn test_writer_preserves_source_order_when_first_is_slowest() {
        let transport = Arc::new(PathEcho::new().delay("/path/to/1", Duration::from_millis(100)));
        let downloader = downloader(transport, 3);
        let mut out = Vec::new();

        downloader
            .download_in_writer(
                &CancellationToken::new(),
                &mut out,
                &sources(&["/path/to/1", "/path/to/2", "/path/to/3"]),
            )
            .await
            .unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "/path/to/1/path/to/2/path/to/3"
        );
    }

    #[tokio::test]
    async fn test_writer_order_for_every_slow_position() {
        for slow in 0..4 {
            let paths = ["/a", "/b", "/c", "/d"];
            let transport =
                Arc::new(PathEcho::new().delay(paths[slow], Duration::from_millis(40)));
            let mut out = Vec::new();
            downloader(transport, 4)
                .download_in_writer(&CancellationToken::new(), &mut out, &sources(&paths))
                .await
                .unwrap();
            assert_eq!(String::from_utf8(out).unwrap(), "/a/b/c/d", "slow={slow}");
        }
    }

    #[tokio::test]
    async fn test_directory_mode_writes_one_file_per_source() {
        let temp_dir = TempDir::new().unwrap();
        let transport = Arc::new(PathEcho::new().delay("/path/to/2", Duration::from_millis(50)));

        downloader(transport, 2)
            .download_in_directory(
                &CancellationToken::new(),
                temp_dir.path(),
                &sources(&["/path/to/1", "/path/to/2", "/path/to/3"]),
            )
            .await
            .unwrap();

        for n in 1..=3 {
            let content = std::fs::read_to_string(temp_dir.path().join(n.to_string())).unwrap();
            assert_eq!(content, format!("/path/to/{n}"));
        }
    }

    #[tokio::test]
    async fn test_directory_mode_uses_explicit_names() {
        let temp_dir = TempDir::new().unwrap();
        let transport = Arc::new(PathEcho::new());
        let sources = vec![
            DownloadSource::new("http://example.com/x").with_name("first.txt"),
            DownloadSource::new("http://example.com/x?page=2").with_name("second.txt"),
        ];

        downloader(transport, 2)
            .download_in_directory(&CancellationToken::new(), temp_dir.path(), &sources)
            .await
            .unwrap();

        assert!(temp_dir.path().join("first.txt").exists());
        assert!(temp_dir.path().join("second.txt").exists());
    }

    #[tokio::test]
    async fn test_directory_mode_rejects_duplicate_names() {
        let temp_dir = TempDir::new().unwrap();
        let transport = Arc::new(PathEcho::new());
        let result = downloader(Arc::clone(&transport), 2)
            .download_in_directory(
                &CancellationToken::new(),
                temp_dir.path(),
                &sources(&["/same/file", "/other/file"]),
            )
            .await;

        assert!(matches!(
            result,
            Err(DownloadError::DuplicateDestination { first: 0, second: 1, .. })
        ));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_directory_mode_failure_keeps_finished_files() {
        let temp_dir = TempDir::new().unwrap();
        let transport = Arc::new(PathEcho::new().broken("/cut/b"));

        // Concurrency 1 makes "/done/a" finish before "/cut/b" starts.
        let result = downloader(transport, 1)
            .download_in_directory(
                &CancellationToken::new(),
                temp_dir.path(),
                &sources(&["/done/a", "/cut/b"]),
            )
            .await;

        assert!(
            matches!(result, Err(DownloadError::Body { index: 1, .. })),
            "expected body error, got {result:?}"
        );
        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("a")).unwrap(),
            "/done/a"
        );
        assert!(!temp_dir.path().join("b").exists(), "partial file must be removed");
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let mut echo = PathEcho::new();
        let paths: Vec<String> = (0..12).map(|i| format!("/item/{i}")).collect();
        for path in &paths {
            echo = echo.delay(path, Duration::from_millis(15));
        }
        let transport = Arc::new(echo);
        let path_refs: Vec<&str> = paths.iter().map(String::as_str).collect();

        let mut out = Vec::new();
        downloader(Arc::clone(&transport), 3)
            .download_in_writer(&CancellationToken::new(), &mut out, &sources(&path_refs))
            .await
            .unwrap();

        assert!(transport.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 12);
    }

    #[tokio::test]
    async fn test_writer_failure_writes_nothing() {
        let transport = Arc::new(
            PathEcho::new()
                .status("/b", 404)
                .delay("/a", Duration::from_millis(20)),
        );
        let mut out = Vec::new();

        let result = downloader(transport, 3)
            .download_in_writer(&CancellationToken::new(), &mut out, &sources(&["/a", "/b", "/c"]))
            .await;

        match result {
            Err(DownloadError::Status { index, status, .. }) => {
                assert_eq!(index, 1);
                assert_eq!(status, StatusCode::NOT_FOUND);
            }
            other => panic!("expected status error, got {other:?}"),
        }
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_failure_stops_queued_sources() {
        let mut echo = PathEcho::new().status("/0", 400);
        for i in 1..10 {
            echo = echo.delay(&format!("/{i}"), Duration::from_millis(50));
        }
        let transport = Arc::new(echo);
        let paths: Vec<String> = (0..10).map(|i| format!("/{i}")).collect();
        let path_refs: Vec<&str> = paths.iter().map(String::as_str).collect();

        let mut out = Vec::new();
        let result = downloader(Arc::clone(&transport), 1)
            .download_in_writer(&CancellationToken::new(), &mut out, &sources(&path_refs))
            .await;

        assert!(matches!(result, Err(DownloadError::Status { index: 0, .. })));
        assert!(transport.calls.load(Ordering::SeqCst) < 10);
    }

    #[tokio::test]
    async fn test_file_mode_not_created_on_failure() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("out.bin");
        let transport = Arc::new(PathEcho::new().status("/c", 500));

        let result = downloader(transport, 2)
            .download_in_file(&CancellationToken::new(), &path, &sources(&["/a", "/c"]))
            .await;

        assert!(matches!(
            result,
            Err(DownloadError::Send {
                index: 1,
                source: crate::download::SendError::Exhausted { attempts: 2, .. },
                ..
            })
        ));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_caller_cancellation_is_reported_as_cancelled() {
        let transport = Arc::new(PathEcho::new().delay("/slow", Duration::from_secs(30)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let mut out = Vec::new();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            downloader(transport, 2).download_in_writer(&cancel, &mut out, &sources(&["/slow"])),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }

    #[tokio::test]
    async fn test_closed_downloader_fails_fast() {
        let temp_dir = TempDir::new().unwrap();
        let downloader = downloader(Arc::new(PathEcho::new()), 2);
        downloader.close();
        assert!(downloader.is_closed());

        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        assert!(matches!(
            downloader
                .download_in_writer(&cancel, &mut out, &sources(&["/a"]))
                .await,
            Err(DownloadError::Closed)
        ));
        assert!(matches!(
            downloader
                .download_in_directory(&cancel, temp_dir.path(), &sources(&["/a"]))
                .await,
            Err(DownloadError::Closed)
        ));
        assert!(matches!(
            downloader
                .download_in_file(&cancel, &temp_dir.path().join("f"), &sources(&["/a"]))
                .await,
            Err(DownloadError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_empty_sources() {
        let temp_dir = TempDir::new().unwrap();
        let downloader = downloader(Arc::new(PathEcho::new()), 2);
        let cancel = CancellationToken::new();

        let mut out = Vec::new();
        downloader
            .download_in_writer(&cancel, &mut out, &[])
            .await
            .unwrap();
        assert!(out.is_empty());

        let path = temp_dir.path().join("empty");
        downloader
            .download_in_file(&cancel, &path, &[])
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_invalid_url_fails_source() {
        let downloader = downloader(Arc::new(PathEcho::new()), 2);
        let mut out = Vec::new();
        let result = downloader
            .download_in_writer(
                &CancellationToken::new(),
                &mut out,
                &[DownloadSource::new("not a url")],
            )
            .await;
        assert!(matches!(result, Err(DownloadError::InvalidUrl { .. })));
    }
}
