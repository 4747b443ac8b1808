//! Change detection against the catalog.

use std::fmt;
use std::io;
use std::path::Path;
use thiserror::Error;

use super::checksum::{checksum_file, ChecksumAlgorithm};
use crate::catalog::{Catalog, CatalogError, FileRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadReason {
    New,
    Modified,
    Reappeared,
}

impl fmt::Display for UploadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadReason::New => f.write_str("new"),
            UploadReason::Modified => f.write_str("modified"),
            UploadReason::Reappeared => f.write_str("reappeared"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDecision {
    Skip,
    Upload(UploadReason),
}

/// Apply the decision table to a catalog record and a fresh checksum.
///
/// Checksums carry their algorithm prefix, so a record hashed with a
/// different algorithm never compares equal and is treated as modified.
pub fn decide(record: Option<&FileRecord>, checksum: &str) -> ChangeDecision {
    match record {
        None => ChangeDecision::Upload(UploadReason::New),
        Some(r) if r.archived => ChangeDecision::Upload(UploadReason::Reappeared),
        Some(r) if r.checksum == checksum => ChangeDecision::Skip,
        Some(_) => ChangeDecision::Upload(UploadReason::Modified),
    }
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("failed to read {path}: {source}")]
    Local {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub checksum: String,
    pub size: u64,
    pub decision: ChangeDecision,
}

#[derive(Debug, Clone, Copy)]
pub struct ChangeDetector {
    algorithm: ChecksumAlgorithm,
}

impl ChangeDetector {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Hash `local_path` and compare it with the catalog entry for `key`.
    /// Blocking: run it off the async executor.
    pub fn evaluate(&self, catalog: &Catalog, key: &str, local_path: &Path) -> Result<Evaluation, DetectError> {
        let (checksum, size) =
            checksum_file(local_path, self.algorithm).map_err(|source| DetectError::Local {
                path: key.to_string(),
                source,
            })?;
        let record = catalog.get(key)?;
        let decision = decide(record.as_ref(), &checksum);
        Ok(Evaluation {
            checksum,
            size,
            decision,
        })
    }
}
