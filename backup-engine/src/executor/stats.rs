//! Counters shared by the scanner, the workers and the progress reporter.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Failed paths kept for the summary. The counter keeps counting past it.
pub const MAX_RECORDED_FAILURES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedPath {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct RunStats {
    scanned: AtomicU64,
    uploaded: AtomicU64,
    skipped: AtomicU64,
    archived: AtomicU64,
    failed: AtomicU64,
    bytes_uploaded: AtomicU64,
    processed: AtomicU64,
    failures: Mutex<Vec<FailedPath>>,
}

/// Point-in-time copy of [`RunStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub scanned: u64,
    pub uploaded: u64,
    pub skipped: u64,
    pub archived: u64,
    pub failed: u64,
    pub bytes_uploaded: u64,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_scanned(&self) {
        self.scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_archived(&self, count: u64) {
        self.archived.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_failure(&self, path: impl Into<String>, reason: impl Into<String>) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        if failures.len() < MAX_RECORDED_FAILURES {
            failures.push(FailedPath {
                path: path.into(),
                reason: reason.into(),
            });
        }
    }

    /// Bump the processed-task counter and return the new value.
    pub fn record_processed(&self) -> u64 {
        self.processed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn scanned(&self) -> u64 {
        self.scanned.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> Vec<FailedPath> {
        self.failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            scanned: self.scanned.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            archived: self.archived.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
        }
    }
}
