//! Marks catalog records whose files vanished from the library as archived.
//! Nothing is ever deleted from the catalog or the store.

use tracing::{debug, info};

use crate::catalog::{Catalog, CatalogError};
use crate::fs::walker::ScanOutcome;

const ARCHIVE_BATCH: usize = 500;

/// Archive every live record not observed by a completed scan. Blocking.
/// Returns the number of records archived.
pub fn reconcile(catalog: &Catalog, outcome: &ScanOutcome) -> Result<u64, CatalogError> {
    if !outcome.completed {
        info!("[Reconcile] Scan did not complete, skipping reconciliation");
        return Ok(0);
    }

    let mut archived = 0u64;
    let mut batch = Vec::with_capacity(ARCHIVE_BATCH);
    // Keyset paging only looks forward, so archiving rows already passed is safe.
    for path in catalog.all_paths() {
        let path = path?;
        if outcome.observed.contains(&path) {
            continue;
        }
        if outcome.is_shadowed(&path) {
            debug!("[Reconcile] Keeping {} (parent directory unreadable)", path);
            continue;
        }
        debug!("[Reconcile] Archiving {}", path);
        batch.push(path);
        if batch.len() >= ARCHIVE_BATCH {
            archived += catalog.mark_archived_batch(&batch)? as u64;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        archived += catalog.mark_archived_batch(&batch)? as u64;
    }

    info!("[Reconcile] Archived {} vanished files", archived);
    Ok(archived)
}
