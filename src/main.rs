//! CLI entry point for fetchkit.

use std::io::{self, IsTerminal, Read};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fetchkit_core::server::{ServeOptions, health_router, serve};
use fetchkit_core::{
    DownloadSource, Downloader, DownloaderOptions, Lifecycle, RetryPolicy, SenderOptions,
};
use tracing::{debug, info};

mod cli;

use cli::{Args, Command, DownloadArgs, ServeArgs};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // Logs go to stderr; stdout may carry downloaded bytes.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let lifecycle = Lifecycle::new();
    lifecycle.stop_on_signal();

    let result = match args.command {
        Command::Download(download) => run_download(&lifecycle, download).await,
        Command::Serve(serve_args) => run_serve(&lifecycle, serve_args).await,
    };

    lifecycle.stop();
    lifecycle.wait().await;
    result
}

async fn run_download(lifecycle: &Lifecycle, args: DownloadArgs) -> Result<()> {
    let urls = if !args.urls.is_empty() {
        args.urls
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        parse_url_lines(&buffer)
    } else {
        info!("No input provided. Pipe URLs via stdin or pass as arguments.");
        info!("Example: echo 'https://example.com/file.pdf' | fetchkit download -d out");
        return Ok(());
    };

    if urls.is_empty() {
        info!("No URLs found in input");
        return Ok(());
    }

    let sources: Vec<DownloadSource> = urls.into_iter().map(DownloadSource::from).collect();

    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .context("failed to build HTTP client")?;

    let options = DownloaderOptions {
        concurrency: usize::from(args.concurrency),
        sender: SenderOptions {
            policy: RetryPolicy::new(u32::from(args.max_retries)),
            timeout: args.timeout.map(Duration::from_secs),
        },
    };
    let downloader = Downloader::new(client, options)?;
    let cancel = lifecycle.child_token();

    info!(
        sources = sources.len(),
        concurrency = downloader.concurrency(),
        "Starting download"
    );

    let outcome = if let Some(dir) = &args.dir {
        downloader
            .download_in_directory(&cancel, dir, &sources)
            .await
            .with_context(|| format!("download into {} failed", dir.display()))
    } else if let Some(path) = &args.output {
        downloader
            .download_in_file(&cancel, path, &sources)
            .await
            .with_context(|| format!("download into {} failed", path.display()))
    } else {
        let mut stdout = tokio::io::stdout();
        downloader
            .download_in_writer(&cancel, &mut stdout, &sources)
            .await
            .context("download to stdout failed")
    };

    downloader.close();
    outcome?;

    info!(sources = sources.len(), "Download complete");
    Ok(())
}

async fn run_serve(lifecycle: &Lifecycle, args: ServeArgs) -> Result<()> {
    let handle = serve(lifecycle, ServeOptions::new(args.addr, health_router())).await?;
    info!(addr = %handle.local_addr(), "Serving; press Ctrl-C to stop");

    lifecycle.cancelled().await;
    Ok(())
}

/// One URL per non-empty line; `#` starts a comment line.
fn parse_url_lines(input: &str) -> Vec<String> {
    input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
