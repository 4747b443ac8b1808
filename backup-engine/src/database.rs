//! Database dump task: run the dump command, gzip its output, upload it and
//! prune old dumps.

use async_compression::tokio::write::GzipEncoder;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DatabaseConfig;
use crate::retry::RetryPolicy;
use crate::store::{file_stream, ObjectMetadata, ObjectStore, StoreError, DATABASE_PREFIX};
use crate::transfer::progress::format_bytes;

const DUMP_SUFFIX: &str = ".sql.gz";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%SZ";
const TIMESTAMP_LEN: usize = 20;
const MAX_STDERR: usize = 4096;

#[derive(Debug, Error)]
pub enum DatabaseBackupError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("dump command exited with {status}: {stderr}")]
    DumpFailed { status: String, stderr: String },

    #[error("I/O error while writing dump: {0}")]
    Io(#[from] io::Error),

    #[error("upload failed: {0}")]
    Upload(#[from] StoreError),

    #[error("dump task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl DatabaseBackupError {
    /// Only a store rejecting the upload outright aborts the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DatabaseBackupError::Upload(e) if e.is_fatal())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseBackupOutcome {
    pub object: String,
    pub compressed_bytes: u64,
    pub pruned: Vec<String>,
}

/// Remote name of a dump taken at `at`.
pub fn dump_object_name(at: DateTime<Utc>, app_version: &str) -> String {
    format!(
        "{}{}-{}{}",
        DATABASE_PREFIX,
        at.format(TIMESTAMP_FORMAT),
        app_version,
        DUMP_SUFFIX
    )
}

fn dump_timestamp(object: &str) -> Option<DateTime<Utc>> {
    let stamp = object.strip_prefix(DATABASE_PREFIX)?.get(..TIMESTAMP_LEN)?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Dumps to delete: everything beyond the newest `keep_count` by name, plus
/// anything older than `max_age`. `current` is never selected.
pub fn expired_dumps(
    objects: &[String],
    current: &str,
    keep_count: usize,
    max_age: Option<ChronoDuration>,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut dumps: Vec<&String> = objects
        .iter()
        .filter(|name| name.starts_with(DATABASE_PREFIX) && name.ends_with(DUMP_SUFFIX))
        .collect();
    dumps.sort_by(|a, b| b.cmp(a));

    dumps
        .into_iter()
        .enumerate()
        .filter(|(_, name)| name.as_str() != current)
        .filter(|(index, name)| {
            *index >= keep_count
                || match (max_age, dump_timestamp(name)) {
                    (Some(max_age), Some(taken)) => now - taken > max_age,
                    _ => false,
                }
        })
        .map(|(_, name)| name.clone())
        .collect()
}

pub struct DatabaseBackup {
    config: DatabaseConfig,
    app_version: String,
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    storage_class: Option<String>,
    work_dir: PathBuf,
}

impl DatabaseBackup {
    pub fn new(
        config: DatabaseConfig,
        app_version: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        retry: RetryPolicy,
        storage_class: Option<String>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            app_version: app_version.into(),
            store,
            retry,
            storage_class,
            work_dir: work_dir.into(),
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<DatabaseBackupOutcome, DatabaseBackupError> {
        let now = Utc::now();
        let object = dump_object_name(now, &self.app_version);
        info!("[DB Backup] Starting database backup: {}", object);

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let temp = tempfile::Builder::new()
            .prefix("db-dump-")
            .suffix(DUMP_SUFFIX)
            .tempfile_in(&self.work_dir)?;

        self.dump_to(temp.path()).await?;
        let compressed_bytes = tokio::fs::metadata(temp.path()).await?.len();
        info!("[DB Backup] Dump compressed to {}", format_bytes(compressed_bytes));

        self.upload(temp.path(), &object, compressed_bytes, cancel).await?;
        info!("[DB Backup] Uploaded {}", object);

        let pruned = self.prune(&object, now).await;
        Ok(DatabaseBackupOutcome {
            object,
            compressed_bytes,
            pruned,
        })
    }

    async fn dump_to(&self, target: &Path) -> Result<(), DatabaseBackupError> {
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DatabaseBackupError::Spawn {
                command: self.config.command.clone(),
                source,
            })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "dump stdout not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "dump stderr not captured"))?;

        // Drain stderr concurrently so a chatty dump cannot fill the pipe.
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await.map(|_| buf)
        });

        let file = tokio::fs::File::create(target).await?;
        let mut encoder = GzipEncoder::new(BufWriter::new(file));
        tokio::io::copy(&mut stdout, &mut encoder).await?;
        encoder.shutdown().await?;

        let status = child.wait().await?;
        let stderr = stderr_task.await??;
        if !status.success() {
            let mut stderr = String::from_utf8_lossy(&stderr).trim().to_string();
            if stderr.len() > MAX_STDERR {
                let mut cut = MAX_STDERR;
                while !stderr.is_char_boundary(cut) {
                    cut -= 1;
                }
                stderr.truncate(cut);
            }
            return Err(DatabaseBackupError::DumpFailed {
                status: status.to_string(),
                stderr,
            });
        }
        Ok(())
    }

    async fn upload(
        &self,
        local: &Path,
        object: &str,
        len: u64,
        cancel: &CancellationToken,
    ) -> Result<(), DatabaseBackupError> {
        self.retry
            .run(&format!("Upload {object}"), cancel, |_| async move {
                let file = tokio::fs::File::open(local)
                    .await
                    .map_err(StoreError::Source)?;
                let metadata = ObjectMetadata {
                    content_length: Some(len),
                    storage_class: self.storage_class.clone(),
                    content_type: Some("application/gzip".to_string()),
                    ..Default::default()
                };
                self.store.put(object, file_stream(file), &metadata).await
            })
            .await?;
        Ok(())
    }

    /// Apply retention. Failures are logged and never fail the backup.
    async fn prune(&self, current: &str, now: DateTime<Utc>) -> Vec<String> {
        info!(
            "[DB Backup] Cleaning up old database backups (keeping last {})",
            self.config.retention_count
        );
        let objects = match self.store.list(DATABASE_PREFIX).await {
            Ok(objects) => objects,
            Err(e) => {
                warn!("[DB Backup] Could not list old backups: {}", e);
                return Vec::new();
            }
        };

        let max_age = self
            .config
            .retention_max_age_days
            .map(|days| ChronoDuration::days(days as i64));
        let mut pruned = Vec::new();
        for old in expired_dumps(&objects, current, self.config.retention_count, max_age, now) {
            match self.store.delete(&old).await {
                Ok(()) => {
                    info!("[DB Backup] Removed old backup: {}", old);
                    pruned.push(old);
                }
                Err(e) => warn!("[DB Backup] Failed to remove {}: {}", old, e),
            }
        }
        pruned
    }
}
