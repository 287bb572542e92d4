//! Compressed, deduplicated file blob storage
//!
//! This crate stores immutable binary payloads ("file blobs") across a set of
//! capacity-bounded storage folders. Content is gzip-compressed at rest,
//! deduplicated against blobs declared with the same digest, reference counted
//! on behalf of its consumers and pinned by locks while being read.
//!
//! # Features
//!
//! - Single-pass ingestion: content is compressed and compared with candidates
//!   while it is streamed in
//! - Collision-safe deduplication: digests are only lookup hints, optionally
//!   verified against the content ([`FileBlobManager::with_digest_verification`])
//! - Folders can be added, resized and removed while blobs are in use
//! - Recovery from snapshots and per-folder metadata, with leftover files
//!   reclaimed (or accounted as zombies)
//!
//! # Example
//!
//! ```rust,no_run
//! use blob_store::{Digest, FileBlobManager, StorageFolderConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), blob_store::BlobStoreError> {
//! let manager = FileBlobManager::new();
//! manager
//!     .add_folder(StorageFolderConfig::new("/var/lib/blobs", 1 << 30))
//!     .await?;
//!
//! let content = b"This is the file content";
//! let digest: Digest = "00112233445566778899aabbccddeeff".parse().unwrap();
//! let id = manager
//!     .add_blob(&content[..], content.len() as u64, digest, &CancellationToken::new())
//!     .await?;
//! manager.increase_reference(id)?;
//!
//! let lock = manager.lock(id).await?;
//! assert_eq!(lock.read_content().await?, content);
//! # Ok(())
//! # }
//! ```

mod codec;
mod config;
mod digest;
mod error;
mod folder;
mod ingest;
mod lifecycle;
mod lock;
mod manager;
mod persistence;
mod references;
mod registry;
mod remover;
mod store;

pub use config::{StorageFolderConfig, StorageFolderStatus};
pub use digest::{Digest, DigestAlgorithm, DigestParseError, DigestState, Sha256Prefix};
pub use error::{BlobStoreError, ErrorKind, Result};
pub use lock::FileBlobLock;
pub use manager::FileBlobManager;
pub use persistence::{BlobRecord, FolderSnapshot, RegistrySnapshot};
pub use remover::{FileRemover, StdFileRemover};
pub use store::BlobStore;

/// Values of the `event` field of the log records an operator (or a test)
/// may want to match on.
pub mod events {
    /// A registered folder's metadata claims a blob another folder holds
    pub const FOLDER_INDEX_CONFLICT: &str = "folder_index_conflict";
    /// A file could not be deleted and became a zombie
    pub const ZOMBIE_DELETE_FAILED: &str = "zombie_delete_failed";
    pub const BLOB_SHORTER_THAN_EXPECTED: &str = "blob_shorter_than_expected";
    pub const BLOB_LONGER_THAN_EXPECTED: &str = "blob_longer_than_expected";
    /// A deduplication candidate could not be read
    pub const CANDIDATE_UNREADABLE: &str = "candidate_unreadable";
    pub const NOT_READY_BLOB_RECOVERED: &str = "not_ready_blob_recovered";
    pub const NOT_READY_BLOB_DISCARDED: &str = "not_ready_blob_discarded";
    pub const BLOB_MISSING_ON_LOAD: &str = "blob_missing_on_load";
    pub const BLOB_SIZE_MISMATCH_ON_LOAD: &str = "blob_size_mismatch_on_load";
    pub const MIGRATION_COPY_FAILED: &str = "migration_copy_failed";
}
