//! Reference counts and locks of file blobs.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::{BlobStoreError, Result};
use crate::lock::FileBlobLock;
use crate::manager::FileBlobManager;
use crate::registry::{wait_for_change, Discard};

impl FileBlobManager {
    /// Add a reference to a file blob.
    pub fn increase_reference(&self, id: Uuid) -> Result<()> {
        let mut state = self.shared.state.lock();
        let entry = state
            .blobs
            .get_mut(&id)
            .ok_or(BlobStoreError::BlobNotFound(id))?;
        entry.reference_count += 1;
        entry.pending_deletion = false;
        Ok(())
    }

    /// Remove a reference to a file blob.
    ///
    /// Removing the last reference deletes the blob, which waits for every
    /// lock on it to be released (and for it to be fully written). The blob is
    /// gone from the registry and from disk when this returns.
    pub async fn decrease_reference(&self, id: Uuid) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            let entry = state
                .blobs
                .get_mut(&id)
                .ok_or(BlobStoreError::BlobNotFound(id))?;
            if entry.reference_count == 0 {
                return Err(BlobStoreError::ReferenceUnderflow(id));
            }
            entry.reference_count -= 1;
            if entry.reference_count > 0 {
                return Ok(());
            }
            entry.pending_deletion = true;
        }

        let discard = loop {
            let rx = {
                let mut state = self.shared.state.lock();
                let Some(entry) = state.blobs.get(&id) else {
                    // Gone already.
                    return Ok(());
                };
                if entry.reference_count > 0 {
                    // Referenced again while waiting, keep it.
                    return Ok(());
                }
                if entry.lock_count == 0 && entry.ready {
                    let discard = Discard {
                        folder: entry.folder.clone(),
                        path: state.blob_path(entry),
                        fallback_size: entry.compressed_size,
                    };
                    drop(state.remove_blob(&id));
                    break discard;
                }
                entry.subscribe()
            };
            wait_for_change(rx).await;
        };

        let path = discard.path.clone();
        self.shared.discard(discard).await;
        debug!(id = %id, path = %path.display(), "file blob deleted");
        Ok(())
    }

    /// Lock a file blob, preventing its file from being deleted or moved
    /// until the returned lock is dropped.
    ///
    /// Waits for the blob to be fully written if it is still being ingested.
    pub async fn lock(&self, id: Uuid) -> Result<FileBlobLock> {
        loop {
            let rx = {
                let mut state = self.shared.state.lock();
                let entry = state
                    .blobs
                    .get(&id)
                    .ok_or(BlobStoreError::BlobNotFound(id))?;
                if entry.ready {
                    let path = state.blob_path(entry);
                    let (digest, compressed_size, size) =
                        (entry.digest, entry.compressed_size, entry.size);
                    if let Some(entry) = state.blobs.get_mut(&id) {
                        entry.lock_count += 1;
                    }
                    return Ok(FileBlobLock::new(
                        Arc::clone(&self.shared),
                        id,
                        digest,
                        compressed_size,
                        size,
                        path,
                    ));
                }
                entry.subscribe()
            };
            wait_for_change(rx).await;
        }
    }
}
