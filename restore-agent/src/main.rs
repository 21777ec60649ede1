//! Restore Agent - Main entry point
//!
//! Restores backed-up table files or commit logs from S3.

use anyhow::Result;
use clap::{Parser, Subcommand};
use restore_agent::store::s3::S3Connector;
use restore_agent::{
    config::Config, shutdown, utils, RestoreContext, RestoreJob, RestoreMode,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Bucket holding the backups (overrides config)
    #[arg(long)]
    bucket: Option<String>,

    /// S3-compatible endpoint URL (overrides config)
    #[arg(long)]
    endpoint: Option<String>,

    /// Name the backups were uploaded under (defaults to this host's name)
    #[arg(short, long)]
    name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Number of download workers
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Download files even if a same-sized local copy exists
    #[arg(short, long)]
    force: bool,

    /// Restore the owner recorded at upload time
    #[arg(short, long)]
    preserve: bool,

    /// Owner for restored files
    #[arg(long)]
    owner: Option<String>,

    /// Group for restored files
    #[arg(long)]
    group: Option<String>,

    /// Check every commit-log segment instead of stopping at the first old one
    #[arg(long)]
    full_scan: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Restore the latest snapshot of every table below SOURCE
    Tables { source: String, target: PathBuf },

    /// Restore one directory
    One {
        source: String,
        target: PathBuf,

        /// Manifest to restore instead of the most recent one
        #[arg(long)]
        manifest: Option<String>,

        /// Manifest entry holding the file list (defaults to SOURCE)
        #[arg(long)]
        origin: Option<String>,
    },

    /// Restore commit-log segments written after the oldest table snapshot
    Commitlog {
        data_source: String,
        log_source: String,
        target: PathBuf,
    },
}

fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn build_job(command: Command, name: &str) -> RestoreJob {
    let namespace = |source: &str| format!("{}:{}", name, source);

    match command {
        Command::Tables { source, target } => RestoreJob {
            prefix: namespace(&source),
            target_dir: target,
            mode: RestoreMode::AllTables,
        },
        Command::One {
            source,
            target,
            manifest,
            origin,
        } => RestoreJob {
            prefix: namespace(&source),
            target_dir: target,
            mode: RestoreMode::Single {
                manifest,
                origin: origin.unwrap_or(source),
            },
        },
        Command::Commitlog {
            data_source,
            log_source,
            target,
        } => RestoreJob {
            prefix: namespace(&data_source),
            target_dir: target,
            mode: RestoreMode::CommitLogs {
                log_prefix: namespace(&log_source),
            },
        },
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    // Command-line overrides
    if let Some(bucket) = args.bucket {
        config.store.bucket = bucket;
    }
    if args.endpoint.is_some() {
        config.store.endpoint = args.endpoint;
    }
    if let Some(concurrency) = args.concurrency {
        config.restore.concurrency = concurrency;
    }
    if let Some(owner) = args.owner {
        config.restore.owner = owner;
    }
    if let Some(group) = args.group {
        config.restore.group = group;
    }
    config.restore.force |= args.force;
    config.restore.preserve_ownership |= args.preserve;
    if args.full_scan {
        config.restore.commitlog_scan = restore_agent::manifest::resolver::LogScan::FullFilter;
    }

    let name = args.name.unwrap_or_else(host_name);
    let job = build_job(args.command, &name);

    tracing::info!(
        "Starting restore-agent v{} (bucket: {}, prefix: {})",
        env!("CARGO_PKG_VERSION"),
        config.store.bucket,
        job.prefix
    );

    let context = RestoreContext::new(
        Arc::new(S3Connector::new(config.store.clone())),
        config.restore.clone(),
    );

    let report = tokio::select! {
        result = context.execute(&job) => result?,
        signal = shutdown::wait_for_signal() => {
            tracing::warn!("Restore interrupted by {}", signal?);
            return Ok(ExitCode::from(130));
        }
    };

    let abandoned = report.abandoned();
    if abandoned.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        tracing::error!("{} files could not be restored", abandoned.len());
        Ok(ExitCode::from(2))
    }
}
