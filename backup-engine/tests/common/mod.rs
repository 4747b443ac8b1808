#![allow(dead_code)]

use async_trait::async_trait;
use backup_engine::catalog::{CatalogDb, FileRecord, CATALOG_OBJECT};
use backup_engine::config::BackendKind;
use backup_engine::daemon::shutdown::ShutdownCoordinator;
use backup_engine::store::{ByteStream, LocalObjectStore, ObjectMetadata, ObjectStore, RejectKind, StoreError};
use backup_engine::{BackupEngine, Config, RunReport};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub enum FaultKind {
    Transient,
    Auth,
}

struct Fault {
    path: String,
    kind: FaultKind,
}

/// Local store wrapper that records calls, injects failures and can hold
/// library uploads behind a gate.
pub struct TestStore {
    inner: LocalObjectStore,
    puts: Mutex<Vec<String>>,
    attempts: Mutex<Vec<String>>,
    deletes: Mutex<Vec<String>>,
    faults: Mutex<Vec<Fault>>,
    gate: watch::Sender<bool>,
    gate_after: AtomicUsize,
    library_puts: AtomicUsize,
    waiting: AtomicUsize,
}

impl TestStore {
    pub fn new(root: &Path) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            inner: LocalObjectStore::new(root),
            puts: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
            gate,
            gate_after: AtomicUsize::new(usize::MAX),
            library_puts: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Every put of `path` fails with `kind`.
    pub fn fail(&self, path: &str, kind: FaultKind) {
        self.faults.lock().unwrap().push(Fault {
            path: path.to_string(),
            kind,
        });
    }

    /// Let `allowed` library uploads through, then hold the rest until
    /// [`TestStore::open_gate`].
    pub fn close_gate_after(&self, allowed: usize) {
        self.gate_after.store(allowed, Ordering::SeqCst);
        self.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }

    pub fn library_puts(&self) -> Vec<String> {
        self.puts()
            .into_iter()
            .filter(|p| p.starts_with("library/"))
            .collect()
    }

    pub fn attempts_for(&self, path: &str) -> usize {
        self.attempts.lock().unwrap().iter().filter(|p| *p == path).count()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    fn fault_for(&self, path: &str) -> Option<StoreError> {
        let faults = self.faults.lock().unwrap();
        faults.iter().find(|f| f.path == path).map(|f| match f.kind {
            FaultKind::Transient => StoreError::Transient(format!("injected failure for {path}")),
            FaultKind::Auth => StoreError::Rejected {
                kind: RejectKind::Auth,
                message: format!("injected rejection for {path}"),
            },
        })
    }
}

#[async_trait]
impl ObjectStore for TestStore {
    async fn put(&self, path: &str, body: ByteStream, metadata: &ObjectMetadata) -> Result<(), StoreError> {
        if path.starts_with("library/") {
            let n = self.library_puts.fetch_add(1, Ordering::SeqCst) + 1;
            if n > self.gate_after.load(Ordering::SeqCst) {
                let mut rx = self.gate.subscribe();
                self.waiting.fetch_add(1, Ordering::SeqCst);
                let _ = rx.wait_for(|open| *open).await;
                self.waiting.fetch_sub(1, Ordering::SeqCst);
            }
        }

        self.attempts.lock().unwrap().push(path.to_string());
        if let Some(err) = self.fault_for(path) {
            return Err(err);
        }
        self.inner.put(path, body, metadata).await?;
        self.puts.lock().unwrap().push(path.to_string());
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<ByteStream, StoreError> {
        self.inner.get(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.deletes.lock().unwrap().push(path.to_string());
        self.inner.delete(path).await
    }
}

/// A library directory, a bucket directory and a scratch directory.
pub struct Harness {
    pub library: TempDir,
    pub bucket: TempDir,
    pub work: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            library: TempDir::new().unwrap(),
            bucket: TempDir::new().unwrap(),
            work: TempDir::new().unwrap(),
        }
    }

    pub fn write(&self, rel: &str, content: &[u8]) {
        let path = self.library.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn remove(&self, rel: &str) {
        std::fs::remove_file(self.library.path().join(rel)).unwrap();
    }

    pub fn store(&self) -> Arc<TestStore> {
        Arc::new(TestStore::new(self.bucket.path()))
    }

    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.engine.app_version = "v1.0.0-test".into();
        config.engine.work_dir = Some(self.work.path().to_path_buf());
        config.source.library_root = self.library.path().to_path_buf();
        config.destination.backend = BackendKind::Local;
        config.destination.root = Some(self.bucket.path().to_path_buf());
        config.pipeline.workers = 2;
        config.pipeline.queue_multiplier = 2;
        config.pipeline.progress_interval_secs = 1;
        config.retry.max_attempts = 3;
        config.retry.base_delay_secs = 0;
        config.database.enabled = false;
        config
    }

    pub fn engine(&self, config: Config, store: Arc<TestStore>) -> BackupEngine {
        self.engine_with_shutdown(config, store, ShutdownCoordinator::new(CancellationToken::new()))
    }

    pub fn engine_with_shutdown(
        &self,
        config: Config,
        store: Arc<TestStore>,
        shutdown: ShutdownCoordinator,
    ) -> BackupEngine {
        let store: Arc<dyn ObjectStore> = store;
        BackupEngine::new(Arc::new(config), store, shutdown)
    }

    pub async fn run(&self, config: Config, store: Arc<TestStore>) -> RunReport {
        self.engine(config, store).run().await
    }

    pub fn object_exists(&self, path: &str) -> bool {
        self.bucket.path().join(path).is_file()
    }

    /// Open a private copy of the catalog currently in the bucket.
    pub fn remote_catalog(&self) -> CatalogDb {
        let copy = self
            .work
            .path()
            .join(format!("inspect-{}.db", uuid::Uuid::new_v4()));
        std::fs::copy(self.bucket.path().join(CATALOG_OBJECT), &copy).unwrap();
        CatalogDb::open_existing(&copy).unwrap()
    }

    pub fn remote_record(&self, key: &str) -> Option<FileRecord> {
        self.remote_catalog().get(key).unwrap()
    }
}

/// Copy a directory tree, standing in for the bucket state at a crash.
pub fn copy_tree(from: &Path, to: &Path) {
    for entry in walkdir::WalkDir::new(from) {
        let entry = entry.unwrap();
        let target: PathBuf = to.join(entry.path().strip_prefix(from).unwrap());
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).unwrap();
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target).unwrap();
        }
    }
}
