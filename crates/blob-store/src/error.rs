//! Error types for the file blob manager.

use std::path::PathBuf;

use uuid::Uuid;

use crate::digest::Digest;

/// Errors that can occur when working with the file blob manager.
#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    /// Unknown file blob identifier
    #[error("file blob not found: {0}")]
    BlobNotFound(Uuid),

    /// Path does not match any registered storage folder
    #[error("storage folder not found: {0}")]
    FolderNotFound(PathBuf),

    /// Storage folder (or an alias of it) is already registered
    #[error("storage folder {path} is already registered as {existing}")]
    FolderAlreadyRegistered { path: PathBuf, existing: PathBuf },

    /// A folder being indexed claims a blob another folder already holds
    #[error("file blob {id} of {folder} is already indexed by {existing}")]
    IndexConflict {
        folder: PathBuf,
        id: Uuid,
        existing: PathBuf,
    },

    /// A folder without metadata that already holds files
    #[error("storage folder {0} is not registered yet but already contains files")]
    FolderNotEmpty(PathBuf),

    /// `load` called on a registry that already holds folders
    #[error("cannot load a snapshot into an already populated registry")]
    RegistryPopulated,

    /// No storage folder can take the requested number of bytes
    #[error("no storage folder has room for {requested} bytes ({available} bytes available)")]
    CapacityExhausted { requested: u64, available: u64 },

    /// Shrinking a folder below the size of its zombies
    #[error("cannot shrink {path} to {requested} bytes, {zombies} bytes are held by zombies")]
    IrreclaimableCapacity {
        path: PathBuf,
        requested: u64,
        zombies: u64,
    },

    /// Reference count would become negative
    #[error("cannot decrease reference count of unreferenced file blob {0}")]
    ReferenceUnderflow(Uuid),

    /// Ingested content does not hash to its declared digest
    #[error("content was declared with digest {expected} but hashes to {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot or folder metadata (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Ingestion cancelled by the caller
    #[error("file blob ingestion cancelled")]
    Cancelled,
}

/// Coarse classification of [`BlobStoreError`], used by outer layers to pick
/// a client-facing status without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    CapacityExhausted,
    IrreclaimableCapacity,
    InvariantViolation,
    InvalidContent,
    Io,
    Cancelled,
}

impl BlobStoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BlobNotFound(_) | Self::FolderNotFound(_) => ErrorKind::NotFound,
            Self::FolderAlreadyRegistered { .. }
            | Self::IndexConflict { .. }
            | Self::FolderNotEmpty(_)
            | Self::RegistryPopulated => ErrorKind::Conflict,
            Self::CapacityExhausted { .. } => ErrorKind::CapacityExhausted,
            Self::IrreclaimableCapacity { .. } => ErrorKind::IrreclaimableCapacity,
            Self::ReferenceUnderflow(_) => ErrorKind::InvariantViolation,
            Self::DigestMismatch { .. } => ErrorKind::InvalidContent,
            Self::Io(_) | Self::Serialization(_) => ErrorKind::Io,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Result type alias for file blob manager operations.
pub type Result<T> = std::result::Result<T, BlobStoreError>;
