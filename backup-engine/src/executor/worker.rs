//! Upload workers: the consumer side of the pipeline.

use std::io;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::{TaskReceiver, UploadTask};
use super::stats::RunStats;
use crate::catalog::Catalog;
use crate::retry::RetryPolicy;
use crate::store::{file_stream, library_object_path, ObjectMetadata, ObjectStore, StoreError};
use crate::sync::{ChangeDecision, ChangeDetector, DetectError, Evaluation};
use crate::transfer::hashing_stream::HashingStream;
use crate::transfer::progress::format_bytes;
use crate::utils::BackupError;

/// Everything a worker needs, shared by the whole pool.
pub struct WorkerContext {
    pub catalog: Arc<Catalog>,
    pub store: Arc<dyn ObjectStore>,
    pub retry: RetryPolicy,
    pub detector: ChangeDetector,
    pub stats: Arc<RunStats>,
    pub cancel: CancellationToken,
    pub checkpoint_interval: u64,
    pub storage_class: Option<String>,
    fatal: Mutex<Option<BackupError>>,
}

impl WorkerContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<Catalog>,
        store: Arc<dyn ObjectStore>,
        retry: RetryPolicy,
        detector: ChangeDetector,
        stats: Arc<RunStats>,
        cancel: CancellationToken,
        checkpoint_interval: u64,
        storage_class: Option<String>,
    ) -> Self {
        Self {
            catalog,
            store,
            retry,
            detector,
            stats,
            cancel,
            checkpoint_interval,
            storage_class,
            fatal: Mutex::new(None),
        }
    }

    /// Record the first run-aborting error and cancel the run.
    pub fn escalate(&self, err: BackupError) {
        error!("Fatal error, aborting run: {}", err);
        let mut slot = self.fatal.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);
        self.cancel.cancel();
    }

    pub fn take_fatal(&self) -> Option<BackupError> {
        self.fatal.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

/// Start `count` workers draining `rx`.
pub fn spawn_workers(count: usize, rx: TaskReceiver, ctx: Arc<WorkerContext>) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|id| {
            let rx = rx.clone();
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { run_worker(id, rx, ctx).await })
        })
        .collect()
}

async fn run_worker(id: usize, rx: TaskReceiver, ctx: Arc<WorkerContext>) {
    debug!("[Worker {}] Started", id);
    loop {
        let task = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        if let Err(e) = process_task(&ctx, task).await {
            ctx.escalate(e);
            break;
        }

        let processed = ctx.stats.record_processed();
        if ctx.checkpoint_interval > 0 && processed % ctx.checkpoint_interval == 0 {
            debug!("[Worker {}] Checkpoint after {} files", id, processed);
            if let Err(e) = ctx.catalog.flush().await {
                ctx.escalate(e.into());
                break;
            }
        }
    }
    debug!("[Worker {}] Stopped", id);
}

/// Handle one task. Per-file problems are recorded in the stats and return
/// `Ok`; only run-aborting errors come back as `Err`.
pub async fn process_task(ctx: &WorkerContext, task: UploadTask) -> Result<(), BackupError> {
    let catalog = Arc::clone(&ctx.catalog);
    let detector = ctx.detector;
    let key = task.key.clone();
    let path = task.local_path.clone();
    let evaluated = tokio::task::spawn_blocking(move || detector.evaluate(&catalog, &key, &path)).await?;

    let evaluation = match evaluated {
        Ok(evaluation) => evaluation,
        Err(DetectError::Local { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            warn!("{} vanished before it could be read, skipping", task.key);
            ctx.stats.record_skipped();
            return Ok(());
        }
        Err(DetectError::Local { path, source }) => {
            warn!("Cannot read {}: {}", path, source);
            ctx.stats.record_failure(path, source.to_string());
            return Ok(());
        }
        Err(DetectError::Catalog(e)) => return Err(e.into()),
    };

    let reason = match evaluation.decision {
        ChangeDecision::Skip => {
            debug!("Skipping {} (unchanged)", task.key);
            ctx.stats.record_skipped();
            return Ok(());
        }
        ChangeDecision::Upload(reason) => reason,
    };

    let object = library_object_path(&task.key);
    info!(
        "Uploading {} -> {} ({}, {})",
        task.key,
        object,
        reason,
        format_bytes(evaluation.size)
    );

    let uploaded = ctx
        .retry
        .run(&format!("Upload {}", task.key), &ctx.cancel, |_| {
            upload_once(ctx, &task, &object, &evaluation)
        })
        .await;

    match uploaded {
        Ok((checksum, size)) => {
            if checksum != evaluation.checksum {
                warn!("{} changed while it was being uploaded", task.key);
            }
            let catalog = Arc::clone(&ctx.catalog);
            let key = task.key.clone();
            tokio::task::spawn_blocking(move || catalog.upsert(&key, &checksum, size)).await??;
            ctx.stats.record_uploaded(size);
            Ok(())
        }
        Err(e) if e.is_fatal() => Err(e.into()),
        Err(e) => {
            warn!("Failed to upload {}: {}", task.key, e);
            ctx.stats.record_failure(&task.key, e.to_string());
            Ok(())
        }
    }
}

/// One attempt: open a fresh stream over the file and put it. Returns the
/// checksum and size of the bytes the store acknowledged.
async fn upload_once(
    ctx: &WorkerContext,
    task: &UploadTask,
    object: &str,
    evaluation: &Evaluation,
) -> Result<(String, u64), StoreError> {
    let file = tokio::fs::File::open(&task.local_path)
        .await
        .map_err(StoreError::Source)?;
    let len = file.metadata().await.map_err(StoreError::Source)?.len();
    let (body, digest) = HashingStream::new(file_stream(file), ctx.detector.algorithm());

    let metadata = ObjectMetadata {
        content_length: Some(len),
        checksum: Some(evaluation.checksum.clone()),
        storage_class: ctx.storage_class.clone(),
        content_type: None,
    };

    match ctx.store.put(object, Box::pin(body), &metadata).await {
        Ok(()) => digest.finish(Some(len)).map_err(StoreError::Source),
        Err(e) => match digest.source_error() {
            Some(source) => Err(StoreError::Source(source)),
            None => Err(e),
        },
    }
}
