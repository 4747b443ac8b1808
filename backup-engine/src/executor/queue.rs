//! Bounded work queue between the scanner and the upload workers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// One file waiting to be checked and possibly uploaded.
#[derive(Debug, Clone)]
pub struct UploadTask {
    /// Library-relative POSIX path, also the catalog key.
    pub key: String,
    pub local_path: PathBuf,
    /// Size and mtime as seen by the scanner.
    pub size: u64,
    pub mtime: Option<SystemTime>,
}

/// Create a queue holding at most `capacity` tasks.
pub fn work_queue(capacity: usize) -> (TaskSender, TaskReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        TaskSender { tx },
        TaskReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// Producer half. Dropping it closes the queue once the backlog drains.
pub struct TaskSender {
    tx: mpsc::Sender<UploadTask>,
}

/// A reserved queue slot. The task is only built after the slot is held, so
/// the number of tasks alive at once never exceeds capacity plus workers.
pub struct Slot<'a> {
    permit: mpsc::Permit<'a, UploadTask>,
}

impl Slot<'_> {
    pub fn send(self, task: UploadTask) {
        self.permit.send(task);
    }
}

impl TaskSender {
    /// Wait for a free slot. Returns `None` when cancelled or when every
    /// receiver is gone.
    pub async fn reserve(&self, cancel: &CancellationToken) -> Option<Slot<'_>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.tx.reserve() => permit.ok().map(|permit| Slot { permit }),
        }
    }

    /// Blocking variant for the scanner thread. Must be called from a
    /// thread started with `spawn_blocking`.
    pub fn reserve_blocking(&self, handle: &Handle, cancel: &CancellationToken) -> Option<Slot<'_>> {
        handle.block_on(self.reserve(cancel))
    }
}

/// Consumer half, shared by every worker.
#[derive(Clone)]
pub struct TaskReceiver {
    rx: Arc<Mutex<mpsc::Receiver<UploadTask>>>,
}

impl TaskReceiver {
    /// Next task, or `None` once the sender is dropped and the queue is empty.
    pub async fn recv(&self) -> Option<UploadTask> {
        self.rx.lock().await.recv().await
    }
}
