//! Backup Engine Library
//!
//! Incremental, append-only backup of a media library and its database into
//! object storage, with change tracking in an SQLite catalog.

pub mod catalog;
pub mod config;
pub mod daemon;
pub mod database;
pub mod executor;
pub mod fs;
pub mod retry;
pub mod store;
pub mod sync;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{BackupEngine, ExitStatus, RunReport};
pub use utils::errors::BackupError;
