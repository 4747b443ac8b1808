//! Persistent change-tracking catalog.
//!
//! The catalog lives remotely as `manifest.db`. A run downloads it into a
//! private working directory, mutates the local copy, and pushes compacted
//! snapshots back at checkpoints and at the end of the run.

pub mod db;

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::retry::RetryPolicy;
use crate::store::{file_stream, ObjectMetadata, ObjectStore, StoreError};

pub use db::{CatalogCounts, CatalogDb, FileRecord, SCHEMA_VERSION};

pub const CATALOG_OBJECT: &str = "manifest.db";
pub const PREVIOUS_CATALOG_OBJECT: &str = "manifest.previous.db";

const SQLITE_CONTENT_TYPE: &str = "application/vnd.sqlite3";
const PATH_PAGE_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("catalog snapshot is corrupt: {0}")]
    Corrupt(String),

    #[error("catalog schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i64, supported: i64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("object store error: {0}")]
    Store(#[from] StoreError),

    #[error("catalog writer lock poisoned")]
    Poisoned,

    #[error("catalog task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Name of the timestamped historical copy written at the end of a run.
pub fn history_object(at: DateTime<Utc>) -> String {
    format!("manifest-{}.db", at.format("%Y%m%dT%H%M%SZ"))
}

pub struct Catalog {
    db: Arc<CatalogDb>,
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    storage_class: Option<String>,
    /// Last snapshot known to be in the store as `manifest.db`. Also
    /// serialises flushes.
    published: tokio::sync::Mutex<Option<PathBuf>>,
    snapshot_seq: AtomicU64,
    work_dir: TempDir,
}

impl Catalog {
    /// Fetch `manifest.db` into a fresh working directory under `work_root`.
    ///
    /// A missing snapshot yields an empty catalog. A snapshot that exists
    /// but does not validate is an error; it is never replaced silently.
    pub async fn load(
        store: Arc<dyn ObjectStore>,
        retry: RetryPolicy,
        work_root: &Path,
        storage_class: Option<String>,
    ) -> Result<Self, CatalogError> {
        tokio::fs::create_dir_all(work_root).await?;
        let work_dir = tempfile::Builder::new()
            .prefix("catalog-")
            .tempdir_in(work_root)?;
        let loaded = work_dir.path().join("loaded.db");
        let working = work_dir.path().join("catalog.db");

        // Loading happens before any cancellation can be observed.
        let never = CancellationToken::new();
        let fetched = retry
            .run("Download catalog", &never, |_| {
                download(store.as_ref(), CATALOG_OBJECT, &loaded)
            })
            .await;

        let (db, published) = match fetched {
            Ok(bytes) => {
                info!("[Catalog] Downloaded {} ({} bytes)", CATALOG_OBJECT, bytes);
                tokio::fs::copy(&loaded, &working).await?;
                let path = working.clone();
                let db = tokio::task::spawn_blocking(move || CatalogDb::open_existing(&path)).await??;
                (db, Some(loaded))
            }
            Err(StoreError::NotFound(_)) => {
                info!("[Catalog] No remote catalog found, starting with an empty one");
                let path = working.clone();
                let db = tokio::task::spawn_blocking(move || CatalogDb::create(&path)).await??;
                (db, None)
            }
            Err(e) => return Err(e.into()),
        };

        let counts = db.counts()?;
        info!(
            "[Catalog] Loaded: {} records ({} archived)",
            counts.total, counts.archived
        );

        Ok(Self {
            db: Arc::new(db),
            store,
            retry,
            storage_class,
            published: tokio::sync::Mutex::new(published),
            snapshot_seq: AtomicU64::new(0),
            work_dir,
        })
    }

    pub fn get(&self, file_path: &str) -> Result<Option<FileRecord>, CatalogError> {
        self.db.get(file_path)
    }

    pub fn upsert(&self, file_path: &str, checksum: &str, size_bytes: u64) -> Result<(), CatalogError> {
        self.db.upsert(file_path, checksum, size_bytes)
    }

    pub fn mark_archived(&self, file_path: &str) -> Result<bool, CatalogError> {
        self.db.mark_archived(file_path)
    }

    pub fn mark_archived_batch(&self, paths: &[String]) -> Result<usize, CatalogError> {
        self.db.mark_archived_batch(paths)
    }

    /// Lazily page through every non-archived path in sorted order.
    pub fn all_paths(&self) -> LivePaths<'_> {
        LivePaths {
            db: self.db.as_ref(),
            after: String::new(),
            buffer: VecDeque::new(),
            done: false,
        }
    }

    pub fn counts(&self) -> Result<CatalogCounts, CatalogError> {
        self.db.counts()
    }

    pub fn metadata(&self, key: &str) -> Result<Option<String>, CatalogError> {
        self.db.get_metadata(key)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<(), CatalogError> {
        self.db.set_metadata(key, value)
    }

    /// Mutations not yet pushed to the store.
    pub fn pending_changes(&self) -> u64 {
        self.db.dirty()
    }

    /// Checkpoint: push a snapshot if anything changed since the last one.
    /// Returns whether a snapshot was uploaded.
    pub async fn flush(&self) -> Result<bool, CatalogError> {
        self.flush_inner(false).await.map(|s| s.is_some())
    }

    /// Final persist at the end of a run: stamp metadata, push the snapshot
    /// unconditionally and keep a timestamped historical copy.
    pub async fn persist(&self, app_version: &str, succeeded: bool) -> Result<(), CatalogError> {
        self.db.set_metadata(db::META_APP_VERSION, app_version)?;
        self.db
            .set_metadata(db::META_SCHEMA_VERSION, &SCHEMA_VERSION.to_string())?;
        if succeeded {
            self.db
                .set_metadata(db::META_LAST_BACKUP, &Utc::now().to_rfc3339())?;
        }

        if let Some(snapshot) = self.flush_inner(true).await? {
            let history = history_object(Utc::now());
            self.upload_snapshot(&snapshot, &history).await?;
            info!("[Catalog] Saved historical copy {}", history);
        }
        Ok(())
    }

    async fn flush_inner(&self, force: bool) -> Result<Option<PathBuf>, CatalogError> {
        let mut published = self.published.lock().await;
        if !force && self.db.dirty() == 0 {
            debug!("[Catalog] Nothing changed since last flush, skipping");
            return Ok(None);
        }

        let taken = self.db.take_dirty();
        let seq = self.snapshot_seq.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.work_dir.path().join(format!("snapshot-{seq}.db"));

        let result = self.publish(&snapshot, published.as_deref()).await;
        if let Err(e) = result {
            self.db.restore_dirty(taken);
            let _ = tokio::fs::remove_file(&snapshot).await;
            return Err(e);
        }

        if let Some(old) = published.replace(snapshot.clone()) {
            let _ = tokio::fs::remove_file(old).await;
        }
        let counts = self.db.counts()?;
        info!(
            "[Catalog] Flushed {} ({} records, {} changes)",
            CATALOG_OBJECT, counts.total, taken
        );
        Ok(Some(snapshot))
    }

    async fn publish(&self, snapshot: &Path, previous: Option<&Path>) -> Result<(), CatalogError> {
        let db = Arc::clone(&self.db);
        let target = snapshot.to_path_buf();
        tokio::task::spawn_blocking(move || db.snapshot_to(&target)).await??;

        if let Some(previous) = previous {
            self.upload_snapshot(previous, PREVIOUS_CATALOG_OBJECT).await?;
        }
        self.upload_snapshot(snapshot, CATALOG_OBJECT).await
    }

    async fn upload_snapshot(&self, local: &Path, object: &str) -> Result<(), CatalogError> {
        let never = CancellationToken::new();
        self.retry
            .run(&format!("Upload {object}"), &never, |_| async move {
                let file = tokio::fs::File::open(local)
                    .await
                    .map_err(StoreError::Source)?;
                let len = file.metadata().await.map_err(StoreError::Source)?.len();
                let metadata = ObjectMetadata {
                    content_length: Some(len),
                    storage_class: self.storage_class.clone(),
                    content_type: Some(SQLITE_CONTENT_TYPE.to_string()),
                    ..Default::default()
                };
                self.store.put(object, file_stream(file), &metadata).await
            })
            .await?;
        Ok(())
    }
}

async fn download(store: &dyn ObjectStore, object: &str, target: &Path) -> Result<u64, StoreError> {
    let stream = store.get(object).await?;
    let mut reader = StreamReader::new(stream);
    let mut file = tokio::fs::File::create(target)
        .await
        .map_err(|e| StoreError::from_io(e, &target.display().to_string()))?;
    let bytes = tokio::io::copy(&mut reader, &mut file)
        .await
        .map_err(|e| StoreError::Transient(format!("{object}: {e}")))?;
    file.flush()
        .await
        .map_err(|e| StoreError::from_io(e, &target.display().to_string()))?;
    Ok(bytes)
}

/// Keyset-paginated iterator over live catalog paths.
pub struct LivePaths<'a> {
    db: &'a CatalogDb,
    after: String,
    buffer: VecDeque<String>,
    done: bool,
}

impl Iterator for LivePaths<'_> {
    type Item = Result<String, CatalogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            match self.db.live_paths_after(&self.after, PATH_PAGE_SIZE) {
                Ok(page) => {
                    self.done = page.len() < PATH_PAGE_SIZE;
                    if let Some(last) = page.last() {
                        self.after = last.clone();
                    }
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
