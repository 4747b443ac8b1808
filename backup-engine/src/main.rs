//! Backup Engine - Main entry point
//!
//! Runs one backup of the library and database, then exits with 0 (success),
//! 1 (partial failure) or 2 (fatal error).

use anyhow::{Context, Result};
use backup_engine::config::{BackendKind, LogFormat};
use backup_engine::daemon::shutdown::ShutdownCoordinator;
use backup_engine::sync::ChecksumAlgorithm;
use backup_engine::{store, utils, BackupEngine, Config, ExitStatus, RunReport};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Library root to back up (overrides config and LIBRARY_PATH)
    #[arg(long, value_name = "DIR")]
    library_root: Option<PathBuf>,

    /// Destination backend
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Bucket name for the gcs backend
    #[arg(long)]
    bucket: Option<String>,

    /// Directory acting as the bucket for the local backend
    #[arg(long, value_name = "DIR")]
    destination_root: Option<PathBuf>,

    /// Number of upload workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Queue slots per worker
    #[arg(long)]
    queue_multiplier: Option<usize>,

    /// Checksum algorithm for change detection
    #[arg(long, value_enum)]
    checksum: Option<ChecksumAlgorithm>,

    /// Processed files between catalog checkpoints
    #[arg(long)]
    checkpoint_interval: Option<u64>,

    /// Number of database dumps to keep
    #[arg(long)]
    db_retention: Option<usize>,

    /// Skip the database dump
    #[arg(long)]
    no_database: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Write the run summary as JSON to this file
    #[arg(long, value_name = "FILE")]
    summary_json: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(root) = &self.library_root {
            config.source.library_root = root.clone();
        }
        if let Some(backend) = self.backend {
            config.destination.backend = backend;
        }
        if let Some(bucket) = &self.bucket {
            config.destination.bucket = bucket.clone();
        }
        if let Some(root) = &self.destination_root {
            config.destination.root = Some(root.clone());
        }
        if let Some(workers) = self.workers {
            config.pipeline.workers = workers;
        }
        if let Some(multiplier) = self.queue_multiplier {
            config.pipeline.queue_multiplier = multiplier;
        }
        if let Some(checksum) = self.checksum {
            config.pipeline.checksum = checksum;
        }
        if let Some(interval) = self.checkpoint_interval {
            config.pipeline.checkpoint_interval = interval;
        }
        if let Some(retention) = self.db_retention {
            config.database.retention_count = retention;
        }
        if self.no_database {
            config.database.enabled = false;
        }
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.log.format = format;
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env()?;
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn write_summary(path: &Path, report: &RunReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write summary to {}", path.display()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("backup-engine: {:#}", e);
            return ExitCode::from(ExitStatus::Fatal.code());
        }
    };

    if let Err(e) = utils::logger::init(&config.log.level, config.log.format) {
        eprintln!("backup-engine: failed to initialise logging: {:#}", e);
        return ExitCode::from(ExitStatus::Fatal.code());
    }

    tracing::info!(
        "Starting backup-engine v{} (app version: {})",
        env!("CARGO_PKG_VERSION"),
        config.engine.app_version
    );

    let store = match store::from_config(&config) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("Cannot set up object store: {}", e);
            return ExitCode::from(ExitStatus::Fatal.code());
        }
    };

    let shutdown = ShutdownCoordinator::new(CancellationToken::new());
    let listener = shutdown.listen();

    let engine = BackupEngine::new(Arc::new(config), store, shutdown.clone());
    let report = engine.run().await;

    // Stop the signal listener now that the run is over.
    shutdown.token().cancel();
    let _ = listener.await;

    if let Some(path) = &args.summary_json {
        if let Err(e) = write_summary(path, &report) {
            tracing::error!("{:#}", e);
        }
    }

    ExitCode::from(report.exit_code)
}
