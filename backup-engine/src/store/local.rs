//! Directory-backed object store.
//!
//! Objects live at `root/<path>`. Writes go to a hidden partial file next to
//! the target and are renamed into place once synced, so a reader never sees
//! a half-written object.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use walkdir::WalkDir;

use super::{file_stream, ByteStream, ObjectMetadata, ObjectStore, RejectKind, StoreError};

const PARTIAL_SUFFIX: &str = ".partial";
const MAX_OBJECT_PATH_LEN: usize = 1024;

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map an object path onto the bucket directory. Paths that could escape
    /// the root are rejected outright; names this filesystem cannot hold are
    /// reported per key.
    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        let malformed = || StoreError::Rejected {
            kind: RejectKind::Malformed,
            message: format!("invalid object path `{path}`"),
        };
        if path.is_empty() || path.ends_with('/') {
            return Err(malformed());
        }
        if path.len() > MAX_OBJECT_PATH_LEN || path.contains('\0') || (cfg!(windows) && path.contains('\\')) {
            return Err(StoreError::InvalidKey(path.to_string()));
        }
        let mut out = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => out.push(part),
                _ => return Err(malformed()),
            }
        }
        Ok(out)
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.{}{}", name, uuid::Uuid::new_v4(), PARTIAL_SUFFIX))
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(
        &self,
        path: &str,
        mut body: ByteStream,
        _metadata: &ObjectMetadata,
    ) -> Result<(), StoreError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::from_io(e, path))?;
        }

        let partial = partial_path(&target);
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| StoreError::from_io(e, path))?;

        let written = async {
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(StoreError::Source)?;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| StoreError::from_io(e, path))?;
            }
            file.flush().await.map_err(|e| StoreError::from_io(e, path))?;
            file.sync_all().await.map_err(|e| StoreError::from_io(e, path))?;
            Ok::<(), StoreError>(())
        }
        .await;
        drop(file);

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }

        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| StoreError::from_io(e, path))?;
        debug!("Stored {}", target.display());
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<ByteStream, StoreError> {
        let target = self.resolve(path)?;
        let file = tokio::fs::File::open(&target)
            .await
            .map_err(|e| StoreError::from_io(e, path))?;
        Ok(file_stream(file))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut paths = Vec::new();
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = entry.map_err(|e| {
                    StoreError::Transient(format!("listing {}: {}", root.display(), e))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX) {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(&prefix) {
                    paths.push(key);
                }
            }
            paths.sort();
            Ok(paths)
        })
        .await
        .map_err(|e| StoreError::Transient(format!("listing task failed: {e}")))?
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let target = self.resolve(path)?;
        tokio::fs::remove_file(&target)
            .await
            .map_err(|e| StoreError::from_io(e, path))
    }
}
