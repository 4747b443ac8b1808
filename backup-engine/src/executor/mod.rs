//! Backup run orchestrator.
//!
//! `LoadCatalog → ScanAndUpload → Reconcile → BackupDatabase → PersistCatalog`.
//! The scanner runs on a blocking thread and feeds a bounded queue drained by
//! a pool of upload workers; the catalog is the only other shared state.

pub mod queue;
pub mod reconcile;
pub mod stats;
pub mod worker;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::{Catalog, CatalogCounts};
use crate::config::Config;
use crate::daemon::shutdown::ShutdownCoordinator;
use crate::database::DatabaseBackup;
use crate::fs::walker::{scan, ScanOptions, ScanOutcome};
use crate::retry::RetryPolicy;
use crate::store::ObjectStore;
use crate::sync::ChangeDetector;
use crate::transfer::progress::{format_bytes, format_duration, format_speed, ThroughputTracker};
use crate::utils::BackupError;
use queue::work_queue;
use stats::{FailedPath, RunStats, StatsSnapshot};
use worker::{spawn_workers, WorkerContext};

/// Process exit status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitStatus {
    Success,
    Partial,
    Fatal,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Partial => 1,
            ExitStatus::Fatal => 2,
        }
    }
}

/// Outcome of the database phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DatabaseStatus {
    Disabled,
    Skipped,
    Succeeded {
        object: String,
        compressed_bytes: u64,
        pruned: Vec<String>,
    },
    Failed {
        error: String,
    },
}

/// Final summary of a run, logged and optionally written as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: u64,
    pub status: ExitStatus,
    pub exit_code: u8,
    pub interrupted: bool,
    pub reconciled: bool,
    pub stats: StatsSnapshot,
    pub database: DatabaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog: Option<CatalogCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
    pub failures: Vec<FailedPath>,
}

/// Main backup engine
pub struct BackupEngine {
    config: Arc<Config>,
    store: Arc<dyn ObjectStore>,
    shutdown: ShutdownCoordinator,
    stats: Arc<RunStats>,
}

struct PhaseResult {
    fatal: Option<BackupError>,
    reconciled: bool,
    database: DatabaseStatus,
    catalog: Option<CatalogCounts>,
}

impl BackupEngine {
    pub fn new(config: Arc<Config>, store: Arc<dyn ObjectStore>, shutdown: ShutdownCoordinator) -> Self {
        Self {
            config,
            store,
            shutdown,
            stats: Arc::new(RunStats::new()),
        }
    }

    /// Live counters of the current run.
    pub fn stats(&self) -> Arc<RunStats> {
        Arc::clone(&self.stats)
    }

    /// Execute one backup run. Never panics on run failures; the outcome is
    /// in the returned report.
    pub async fn run(&self) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("backup", run_id = %run_id);

        async {
            info!(
                "Starting backup of {} (workers: {}, queue: {}, checksum: {})",
                self.config.source.library_root.display(),
                self.config.pipeline.workers,
                self.config.queue_capacity(),
                self.config.pipeline.checksum
            );
            let phases = self.run_phases().await;
            let report = self.build_report(run_id, started_at, phases);
            log_summary(&report);
            report
        }
        .instrument(span)
        .await
    }

    async fn run_phases(&self) -> PhaseResult {
        let config = &self.config;
        let mut result = PhaseResult {
            fatal: None,
            reconciled: false,
            database: if config.database.enabled {
                DatabaseStatus::Skipped
            } else {
                DatabaseStatus::Disabled
            },
            catalog: None,
        };

        let root = config.source.library_root.clone();
        if !tokio::fs::metadata(&root).await.map(|m| m.is_dir()).unwrap_or(false) {
            result.fatal = Some(BackupError::LibraryRoot(root.display().to_string()));
            return result;
        }

        let retry = RetryPolicy::from_config(&config.retry);
        let storage_class = config.destination.storage_class.clone();

        // LoadCatalog
        let catalog = match Catalog::load(
            Arc::clone(&self.store),
            retry,
            &config.work_dir(),
            storage_class.clone(),
        )
        .await
        {
            Ok(catalog) => Arc::new(catalog),
            Err(e) => {
                result.fatal = Some(e.into());
                return result;
            }
        };

        // ScanAndUpload
        let cancel = self.shutdown.token();
        let ctx = Arc::new(WorkerContext::new(
            Arc::clone(&catalog),
            Arc::clone(&self.store),
            retry,
            ChangeDetector::new(config.pipeline.checksum),
            Arc::clone(&self.stats),
            cancel.clone(),
            config.pipeline.checkpoint_interval,
            storage_class.clone(),
        ));
        let outcome = self.scan_and_upload(root, &ctx, &cancel).await;
        result.fatal = ctx.take_fatal();

        // Reconcile
        if result.fatal.is_none() {
            let reconciling = Arc::clone(&catalog);
            let reconciled = tokio::task::spawn_blocking(move || {
                reconcile::reconcile(&reconciling, &outcome).map(|n| (n, outcome.completed))
            })
            .await;
            match reconciled {
                Ok(Ok((archived, completed))) => {
                    self.stats.record_archived(archived);
                    result.reconciled = completed;
                }
                Ok(Err(e)) => result.fatal = Some(e.into()),
                Err(e) => result.fatal = Some(e.into()),
            }
        }

        // BackupDatabase
        if config.database.enabled && result.fatal.is_none() && !cancel.is_cancelled() {
            let task = DatabaseBackup::new(
                config.database.clone(),
                config.engine.app_version.clone(),
                Arc::clone(&self.store),
                retry,
                storage_class,
                config.work_dir(),
            );
            result.database = match task.run(&cancel).await {
                Ok(outcome) => DatabaseStatus::Succeeded {
                    object: outcome.object,
                    compressed_bytes: outcome.compressed_bytes,
                    pruned: outcome.pruned,
                },
                Err(e) => {
                    error!("[DB Backup] Database backup failed: {}", e);
                    let status = DatabaseStatus::Failed {
                        error: e.to_string(),
                    };
                    if e.is_fatal() {
                        result.fatal = Some(e.into());
                    }
                    status
                }
            };
        }

        // PersistCatalog
        let succeeded = result.fatal.is_none()
            && !self.shutdown.interrupted()
            && self.stats.failed() == 0
            && !matches!(result.database, DatabaseStatus::Failed { .. });
        if let Err(e) = catalog
            .persist(&config.engine.app_version, succeeded)
            .await
        {
            error!("[Catalog] Failed to persist catalog: {}", e);
            result.fatal.get_or_insert(e.into());
        }
        result.catalog = catalog.counts().ok();
        result
    }

    async fn scan_and_upload(
        &self,
        root: PathBuf,
        ctx: &Arc<WorkerContext>,
        cancel: &CancellationToken,
    ) -> ScanOutcome {
        let config = &self.config;
        let (tx, rx) = work_queue(config.queue_capacity());

        let progress_stop = CancellationToken::new();
        let progress = spawn_progress(
            Arc::clone(&self.stats),
            Duration::from_secs(config.pipeline.progress_interval_secs.max(1)),
            progress_stop.clone(),
        );

        let workers = spawn_workers(config.pipeline.workers, rx, Arc::clone(ctx));

        let options = ScanOptions {
            exclude: config.source.exclude.clone(),
        };
        let scan_stats = Arc::clone(&self.stats);
        let scan_cancel = cancel.clone();
        let scanner = tokio::task::spawn_blocking(move || {
            scan(&root, &options, tx, &scan_stats, &scan_cancel)
        });

        let outcome = match scanner.await {
            Ok(outcome) => {
                info!(
                    "[Scanner] Walk {} ({} files found)",
                    if outcome.completed { "complete" } else { "stopped early" },
                    outcome.observed.len()
                );
                outcome
            }
            Err(e) => {
                ctx.escalate(e.into());
                ScanOutcome::default()
            }
        };

        for handle in workers {
            if let Err(e) = handle.await {
                ctx.escalate(e.into());
            }
        }

        progress_stop.cancel();
        let _ = progress.await;
        outcome
    }

    fn build_report(&self, run_id: Uuid, started_at: DateTime<Utc>, phases: PhaseResult) -> RunReport {
        let finished_at = Utc::now();
        let stats = self.stats.snapshot();
        let interrupted = self.shutdown.interrupted();
        let status = if phases.fatal.is_some() {
            ExitStatus::Fatal
        } else if stats.failed > 0
            || interrupted
            || matches!(phases.database, DatabaseStatus::Failed { .. })
        {
            ExitStatus::Partial
        } else {
            ExitStatus::Success
        };

        RunReport {
            run_id,
            started_at,
            finished_at,
            duration_secs: (finished_at - started_at).num_seconds().max(0) as u64,
            status,
            exit_code: status.code(),
            interrupted,
            reconciled: phases.reconciled,
            stats,
            database: phases.database,
            catalog: phases.catalog,
            fatal_error: phases.fatal.map(|e| e.to_string()),
            failures: self.stats.failures(),
        }
    }
}

fn spawn_progress(stats: Arc<RunStats>, period: Duration, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        let mut tracker = ThroughputTracker::new();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop.cancelled() => break,
            }

            let snap = stats.snapshot();
            let speed = tracker.update(snap.bytes_uploaded);
            info!(
                "[Progress] scanned: {}, uploaded: {} ({}), skipped: {}, failed: {}, speed: {}",
                snap.scanned,
                snap.uploaded,
                format_bytes(snap.bytes_uploaded),
                snap.skipped,
                snap.failed,
                format_speed(speed)
            );
        }
    })
}

fn log_summary(report: &RunReport) {
    let s = &report.stats;
    info!("============================================================");
    info!("Backup summary ({:?})", report.status);
    info!("  Files scanned:   {}", s.scanned);
    info!("  Files uploaded:  {} ({})", s.uploaded, format_bytes(s.bytes_uploaded));
    info!("  Files skipped:   {}", s.skipped);
    info!("  Files archived:  {}", s.archived);
    info!("  Files failed:    {}", s.failed);
    match &report.database {
        DatabaseStatus::Succeeded { object, .. } => info!("  Database backup: {}", object),
        DatabaseStatus::Failed { error } => info!("  Database backup: FAILED ({})", error),
        DatabaseStatus::Skipped => info!("  Database backup: skipped"),
        DatabaseStatus::Disabled => info!("  Database backup: disabled"),
    }
    if let Some(counts) = report.catalog {
        info!("  Catalog records: {} ({} archived)", counts.total, counts.archived);
    }
    info!("  Duration:        {}", format_duration(report.duration_secs));
    info!("============================================================");

    if report.interrupted {
        warn!("Run was interrupted before completion");
    }
    for failure in report.failures.iter().take(20) {
        warn!("  failed: {}: {}", failure.path, failure.reason);
    }
    if s.failed > 20 {
        warn!("  ... and {} more failures", s.failed - 20);
    }
    if let Some(fatal) = &report.fatal_error {
        error!("Backup aborted: {}", fatal);
    }
}
