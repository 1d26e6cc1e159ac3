use std::path::PathBuf;

use thiserror::Error;

/// Failures reported by a [`JobQueue`](crate::queue::JobQueue) backend.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed queue entry for {node}/{jid}: {source}")]
    Malformed {
        node: String,
        jid: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Queue rejected write: {0}")]
    Rejected(String),
}

/// Failures resolving node patterns.
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Invalid node pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Node directory unavailable: {0}")]
    Unavailable(#[from] std::io::Error),
}

/// Failures reported by a [`BlobStore`](crate::artifact::BlobStore).
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Blob storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures sealing or opening an `aes` envelope.
#[derive(Error, Debug)]
pub enum CryptError {
    #[error("Encryption key is empty")]
    EmptyKey,

    #[error("Payload (de)serialization failed: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Ciphertext is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Ciphertext too short")]
    Truncated,

    #[error("Encryption failed")]
    Seal,

    #[error("Decryption failed (wrong token or corrupted payload)")]
    Open,
}

/// Failures staging or placing an artifact.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Missing path argument: {0}")]
    MissingPath(&'static str),

    #[error("Local file not found: {0}")]
    LocalNotFound(PathBuf),

    #[error("Not a content id: {0:?}")]
    InvalidContentId(String),

    #[error("Blob {0} not present in cache after download")]
    CacheMiss(String),

    #[error("Copy to {path} failed: {source}")]
    Copy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Blob(#[from] BlobError),
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Crypt(#[from] CryptError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;

impl DispatchError {
    /// Short label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Queue(_) => "queue",
            DispatchError::Directory(_) => "directory",
            DispatchError::Crypt(_) => "crypt",
            DispatchError::Artifact(_) => "artifact",
            DispatchError::Config(_) => "config",
        }
    }
}
