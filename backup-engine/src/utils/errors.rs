//! Run-level error type for the backup engine.
//!
//! Subsystems keep their own error enums; this aggregate is what the
//! orchestrator and the binary deal with.

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::database::DatabaseBackupError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Object store error: {0}")]
    Store(#[from] StoreError),

    #[error("Database backup error: {0}")]
    Database(#[from] DatabaseBackupError),

    #[error("Library root is not a directory: {0}")]
    LibraryRoot(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
