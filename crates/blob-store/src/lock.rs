use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::codec::InflateReader;
use crate::digest::Digest;
use crate::error::Result;
use crate::manager::Shared;

/// Pins a file blob: while the lock is alive its file is neither deleted nor
/// moved. Dropping the lock releases it and lets a deferred deletion or move
/// of the blob proceed.
pub struct FileBlobLock {
    shared: Arc<Shared>,
    id: Uuid,
    digest: Digest,
    compressed_size: u64,
    size: u64,
    path: PathBuf,
}

impl FileBlobLock {
    pub(crate) fn new(
        shared: Arc<Shared>,
        id: Uuid,
        digest: Digest,
        compressed_size: u64,
        size: u64,
        path: PathBuf,
    ) -> Self {
        Self {
            shared,
            id,
            digest,
            compressed_size,
            size,
            path,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    /// Size of the file on disk
    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    /// Size of the content
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Compressed blob file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decompress the whole content of the blob.
    pub async fn read_content(&self) -> Result<Vec<u8>> {
        let content = InflateReader::open(&self.path).await?.read_to_end().await?;
        Ok(content)
    }
}

impl std::fmt::Debug for FileBlobLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBlobLock")
            .field("id", &self.id)
            .field("digest", &self.digest)
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for FileBlobLock {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if let Some(entry) = state.blobs.get_mut(&self.id) {
            entry.lock_count = entry.lock_count.saturating_sub(1);
            if entry.lock_count == 0 {
                entry.notify();
            }
        }
    }
}
