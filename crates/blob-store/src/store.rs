use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::StorageFolderStatus;
use crate::digest::Digest;
use crate::error::Result;
use crate::lock::FileBlobLock;
use crate::manager::FileBlobManager;

/// Blob storage as seen by the consumers of blobs (payload catalogs, launch
/// orchestration). Folder management and persistence are left to whoever
/// owns the process.
///
/// Reference counts belong to the consumers: adding content never adds a
/// reference, and the last reference removed deletes the blob.
#[async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug {
    /// Store `length` bytes of `content`, or find a blob already holding
    /// them, and return its id.
    async fn add_blob(
        &self,
        content: &mut (dyn AsyncRead + Send + Unpin),
        length: u64,
        digest: Digest,
        cancel: &CancellationToken,
    ) -> Result<Uuid>;

    fn increase_reference(&self, id: Uuid) -> Result<()>;

    /// Remove a reference, deleting the blob once the last one is gone and
    /// it is no longer locked.
    async fn decrease_reference(&self, id: Uuid) -> Result<()>;

    /// Pin a blob for reading.
    async fn lock(&self, id: Uuid) -> Result<FileBlobLock>;

    fn folder_status(&self) -> Vec<StorageFolderStatus>;
}

#[async_trait]
impl BlobStore for FileBlobManager {
    async fn add_blob(
        &self,
        content: &mut (dyn AsyncRead + Send + Unpin),
        length: u64,
        digest: Digest,
        cancel: &CancellationToken,
    ) -> Result<Uuid> {
        FileBlobManager::add_blob(self, content, length, digest, cancel).await
    }

    fn increase_reference(&self, id: Uuid) -> Result<()> {
        FileBlobManager::increase_reference(self, id)
    }

    async fn decrease_reference(&self, id: Uuid) -> Result<()> {
        FileBlobManager::decrease_reference(self, id).await
    }

    async fn lock(&self, id: Uuid) -> Result<FileBlobLock> {
        FileBlobManager::lock(self, id).await
    }

    fn folder_status(&self) -> Vec<StorageFolderStatus> {
        FileBlobManager::folder_status(self)
    }
}
