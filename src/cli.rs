//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use fetchkit_core::server::DEFAULT_ADDR;
use fetchkit_core::{DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES};

/// Fetch many URLs concurrently, or serve a lifecycle-bound health endpoint.
///
/// Downloads are retried on transient failures and, when written to a single
/// file or stdout, concatenated in the order the URLs were given.
#[derive(Parser, Debug)]
#[command(name = "fetchkit")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download URLs (from arguments or stdin, one per line)
    Download(DownloadArgs),
    /// Serve /health until interrupted
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
pub struct DownloadArgs {
    /// URLs to fetch; read from stdin when omitted
    pub urls: Vec<String>,

    /// Maximum concurrent downloads (1-100)
    #[arg(short = 'c', long, default_value_t = DEFAULT_CONCURRENCY as u8, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: u8,

    /// Maximum retry attempts for transient failures (0-10)
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_RETRIES as u8, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: u8,

    /// Per-attempt request timeout in seconds (1-3600)
    #[arg(short = 't', long, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub timeout: Option<u64>,

    /// Write each download to its own file in this directory
    #[arg(short = 'd', long, conflicts_with = "output")]
    pub dir: Option<PathBuf>,

    /// Concatenate all downloads, in order, into this file
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(short = 'a', long, default_value = DEFAULT_ADDR)]
    pub addr: String,
}
