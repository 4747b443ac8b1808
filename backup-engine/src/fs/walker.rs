//! Library tree scanner: the producer side of the upload pipeline.
//!
//! One depth-first pass over the library. Each regular file becomes an
//! [`UploadTask`] pushed into the bounded queue; the queue slot is reserved
//! before the task is built so a slow store throttles the walk.

use std::collections::HashSet;
use std::io;
use std::path::{Component, Path};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::executor::queue::{TaskSender, UploadTask};
use crate::executor::stats::RunStats;

/// Options for the library walk
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// File or directory names skipped wherever they appear (exact match).
    pub exclude: Vec<String>,
}

/// What the scanner saw, handed to reconciliation once the queue drains.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Keys of every file that exists locally, uploaded or not.
    pub observed: HashSet<String>,
    /// Key prefixes (ending in `/`, or empty for the root) of directories
    /// that could not be read. Records below them must not be archived.
    pub unreadable: Vec<String>,
    /// False when the walk stopped early.
    pub completed: bool,
}

impl ScanOutcome {
    /// Whether `key` sits below a directory the scan could not read.
    pub fn is_shadowed(&self, key: &str) -> bool {
        self.unreadable.iter().any(|prefix| key.starts_with(prefix.as_str()))
    }
}

/// Library-relative POSIX key for `path`, or `None` when it cannot be
/// expressed as UTF-8.
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

fn is_excluded(entry: &DirEntry, exclude: &[String]) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    exclude.iter().any(|pattern| name == pattern.as_str())
}

/// Walk `root` and feed the queue. Runs on a blocking thread; the sender is
/// dropped on return, which closes the queue.
pub fn scan(
    root: &Path,
    options: &ScanOptions,
    tx: TaskSender,
    stats: &RunStats,
    cancel: &CancellationToken,
) -> ScanOutcome {
    let handle = Handle::current();
    let mut outcome = ScanOutcome::default();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_excluded(e, &options.exclude));

    for entry in walker {
        if cancel.is_cancelled() {
            debug!("[Scanner] Cancelled, stopping walk");
            return outcome;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                record_walk_error(root, &err, stats, &mut outcome);
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        if !file_type.is_file() {
            debug!("[Scanner] Skipping non-regular file {}", entry.path().display());
            continue;
        }

        let Some(key) = relative_key(root, entry.path()) else {
            warn!("[Scanner] Skipping path that is not valid UTF-8: {}", entry.path().display());
            stats.record_failure(entry.path().to_string_lossy(), "path is not valid UTF-8");
            continue;
        };

        let Some(slot) = tx.reserve_blocking(&handle, cancel) else {
            debug!("[Scanner] Queue closed or cancelled, stopping walk");
            return outcome;
        };

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) if is_not_found(&err) => {
                debug!("[Scanner] {} vanished during scan", key);
                continue;
            }
            Err(err) => {
                warn!("[Scanner] Cannot stat {}: {}", key, err);
                stats.record_failure(&key, err.to_string());
                outcome.observed.insert(key);
                continue;
            }
        };

        stats.record_scanned();
        outcome.observed.insert(key.clone());
        slot.send(UploadTask {
            key,
            local_path: entry.into_path(),
            size: metadata.len(),
            mtime: metadata.modified().ok(),
        });
    }

    outcome.completed = true;
    outcome
}

fn is_not_found(err: &walkdir::Error) -> bool {
    err.io_error()
        .map(|e| e.kind() == io::ErrorKind::NotFound)
        .unwrap_or(false)
}

fn record_walk_error(root: &Path, err: &walkdir::Error, stats: &RunStats, outcome: &mut ScanOutcome) {
    let Some(path) = err.path() else {
        warn!("[Scanner] Walk error: {}", err);
        stats.record_failure(root.to_string_lossy(), err.to_string());
        return;
    };
    if is_not_found(err) {
        debug!("[Scanner] {} vanished during scan", path.display());
        return;
    }

    let key = relative_key(root, path).unwrap_or_else(|| path.to_string_lossy().into_owned());
    warn!("[Scanner] Cannot read {}: {}", path.display(), err);
    stats.record_failure(if key.is_empty() { "." } else { key.as_str() }, err.to_string());

    // An unreadable entry is usually a directory; remember it so that
    // nothing below it is mistaken for deleted.
    let prefix = if key.is_empty() { String::new() } else { format!("{key}/") };
    outcome.unreadable.push(prefix);
    outcome.observed.insert(key);
}
