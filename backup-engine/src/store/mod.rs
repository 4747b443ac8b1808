//! Object store boundary.
//!
//! The engine only ever talks to storage through [`ObjectStore`]. Errors are
//! classified at this boundary so the retry policy and the orchestrator can
//! tell a flaky network apart from a misconfiguration.

pub mod gcs;
pub mod local;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::io::ReaderStream;

use crate::config::{BackendKind, Config};
use crate::retry::Retryable;

pub use gcs::GcsObjectStore;
pub use local::LocalObjectStore;

/// Object body, streamed in chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Prefix under which library files are stored.
pub const LIBRARY_PREFIX: &str = "library/";

/// Prefix under which database dumps are stored.
pub const DATABASE_PREFIX: &str = "database/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    Auth,
    Permission,
    Malformed,
}

impl fmt::Display for RejectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectKind::Auth => f.write_str("authentication"),
            RejectKind::Permission => f.write_str("permission denied"),
            RejectKind::Malformed => f.write_str("malformed request"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("storage rejected request ({kind}): {message}")]
    Rejected { kind: RejectKind, message: String },

    #[error("failed to read upload source: {0}")]
    Source(#[source] io::Error),

    /// The key names a real file but this backend cannot store it.
    #[error("object key not supported by this store: {0}")]
    InvalidKey(String),
}

impl StoreError {
    /// Classify an HTTP status returned by a store.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => StoreError::NotFound(message),
            401 => StoreError::Rejected {
                kind: RejectKind::Auth,
                message,
            },
            403 => StoreError::Rejected {
                kind: RejectKind::Permission,
                message,
            },
            408 | 429 | 500..=599 => StoreError::Transient(format!("HTTP {status}: {message}")),
            _ => StoreError::Rejected {
                kind: RejectKind::Malformed,
                message: format!("HTTP {status}: {message}"),
            },
        }
    }

    /// Classify a local filesystem error raised while touching the store.
    pub fn from_io(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => StoreError::Rejected {
                kind: RejectKind::Permission,
                message: format!("{path}: {err}"),
            },
            _ => StoreError::Transient(format!("{path}: {err}")),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    /// Errors that indicate a configuration problem and abort the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Rejected { .. })
    }
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        StoreError::is_transient(self)
    }
}

/// Metadata sent along with an upload.
#[derive(Debug, Clone, Default)]
pub struct ObjectMetadata {
    pub content_length: Option<u64>,
    pub checksum: Option<String>,
    pub storage_class: Option<String>,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write an object. Returns only once the store has acknowledged it.
    async fn put(&self, path: &str, body: ByteStream, metadata: &ObjectMetadata)
        -> Result<(), StoreError>;

    /// Read an object; `StoreError::NotFound` when it does not exist.
    async fn get(&self, path: &str) -> Result<ByteStream, StoreError>;

    /// All object paths starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn delete(&self, path: &str) -> Result<(), StoreError>;
}

/// Remote path of a library file given its library-relative path.
pub fn library_object_path(relative: &str) -> String {
    format!("{}{}", LIBRARY_PREFIX, relative.trim_start_matches('/'))
}

pub fn file_stream(file: tokio::fs::File) -> ByteStream {
    Box::pin(ReaderStream::new(file))
}

pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    let data: Bytes = data.into();
    Box::pin(futures_util::stream::once(async move { Ok(data) }))
}

/// Build the store selected by the configuration.
pub fn from_config(config: &Config) -> Result<Arc<dyn ObjectStore>, StoreError> {
    let dest = &config.destination;
    match dest.backend {
        BackendKind::Local => {
            let root = dest.root.clone().ok_or_else(|| StoreError::Rejected {
                kind: RejectKind::Malformed,
                message: "local backend requires destination.root".into(),
            })?;
            Ok(Arc::new(LocalObjectStore::new(root)))
        }
        BackendKind::Gcs => {
            let token = std::env::var(&dest.token_env).ok().filter(|t| !t.is_empty());
            if token.is_none() {
                tracing::warn!(
                    "{} is not set, talking to {} without credentials",
                    dest.token_env,
                    dest.endpoint
                );
            }
            let store = GcsObjectStore::new(
                &dest.endpoint,
                &dest.bucket,
                token,
                config.request_timeout(),
                config.connect_timeout(),
            )?;
            Ok(Arc::new(store))
        }
    }
}
