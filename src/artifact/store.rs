use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::artifact::checksum::{file_checksum, is_content_id};
use crate::error::BlobError;

/// Content-addressed blob storage shared by the dispatcher and the node
/// agents.
///
/// Ids returned by `upload` must be the SHA-256 hex digest of the content;
/// the dispatcher compares them against local file checksums.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the file at `path` and return its content id.
    async fn upload(&self, path: &Path) -> Result<String, BlobError>;

    /// Write the blob `content_id` to `dest`.
    async fn download(&self, content_id: &str, dest: &Path) -> Result<(), BlobError>;
}

/// Blob store backed by a directory, one file per content id.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn blob_path(&self, content_id: &str) -> PathBuf {
        self.root.join(content_id)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, path: &Path) -> Result<String, BlobError> {
        let content_id = file_checksum(path)
            .await?
            .ok_or_else(|| BlobError::NotFound(path.display().to_string()))?;

        let target = self.blob_path(&content_id);
        if tokio::fs::try_exists(&target).await? {
            tracing::debug!(content_id = %content_id, "Blob already stored");
            return Ok(content_id);
        }

        tokio::fs::create_dir_all(&self.root).await?;
        let partial = self.root.join(format!(".{}.part", content_id));
        tokio::fs::copy(path, &partial).await?;
        tokio::fs::rename(&partial, &target).await?;
        tracing::debug!(content_id = %content_id, path = %path.display(), "Blob stored");
        Ok(content_id)
    }

    async fn download(&self, content_id: &str, dest: &Path) -> Result<(), BlobError> {
        if !is_content_id(content_id) {
            return Err(BlobError::NotFound(content_id.to_string()));
        }
        match tokio::fs::copy(self.blob_path(content_id), dest).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(BlobError::NotFound(content_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
