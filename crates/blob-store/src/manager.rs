//! The file blob manager handle.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::StorageFolderStatus;
use crate::digest::DigestAlgorithm;
use crate::events;
use crate::registry::{Discard, State};
use crate::remover::{remove_off_thread, FileRemover, StdFileRemover};

pub(crate) struct Shared {
    /// Registry of folders and blobs, the single coordination point
    pub state: Mutex<State>,
    /// Serializes add/update/remove of storage folders, in submission order
    pub folder_ops: tokio::sync::Mutex<()>,
    pub remover: Arc<dyn FileRemover>,
    /// Recomputes the digest of ingested content when set
    pub verifier: Option<Arc<dyn DigestAlgorithm>>,
}

impl Shared {
    /// Delete a file dropped from the registry, off the state lock.
    pub async fn discard(&self, discard: Discard) {
        let size = match tokio::fs::metadata(&discard.path).await {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => discard.fallback_size,
        };
        let outcome = remove_off_thread(&self.remover, &discard.path).await;
        self.settle(discard, size, outcome);
    }

    /// [`Self::discard`] for drop handlers, which cannot wait.
    pub fn discard_now(&self, discard: Discard) {
        let size = match std::fs::metadata(&discard.path) {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => discard.fallback_size,
        };
        let outcome = self.remover.remove_file(&discard.path);
        self.settle(discard, size, outcome);
    }

    fn settle(&self, discard: Discard, size: u64, outcome: io::Result<()>) {
        match outcome {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(
                    event = events::ZOMBIE_DELETE_FAILED,
                    path = %discard.path.display(),
                    size,
                    error = %e,
                    "failed to delete file, it will be reclaimed on next registration of its folder"
                );
                if let Some(folder) = self.state.lock().folders.get_mut(&discard.folder) {
                    folder.count_zombie(size);
                }
            }
        }
    }
}

/// Stores file blobs, compressed and deduplicated, across a set of storage
/// folders.
///
/// - **Ingestion** (`add_blob`) streams content into the folder with the most
///   free space, or returns an existing blob with identical content
/// - **References and locks** decide when a blob's file can be deleted or
///   moved: never while locked, only once unreferenced
/// - **Folder lifecycle** (`add_folder`, `update_folder`, `remove_folder`)
///   migrates blobs between folders while they are in use
/// - **Persistence** (`snapshot`, `load`, `persist_folder_states`) lets a
///   restarted process pick up where it left off
///
/// The manager is a cheap handle: clones share the same registry.
#[derive(Clone)]
pub struct FileBlobManager {
    pub(crate) shared: Arc<Shared>,
}

impl std::fmt::Debug for FileBlobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("FileBlobManager")
            .field("folders", &state.folders.len())
            .field("blobs", &state.blobs.len())
            .finish()
    }
}

impl Default for FileBlobManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FileBlobManager {
    /// Create a manager with no storage folder.
    pub fn new() -> Self {
        Self::with_remover(Arc::new(StdFileRemover))
    }

    /// Create a manager deleting files through `remover`.
    pub fn with_remover(remover: Arc<dyn FileRemover>) -> Self {
        Self::from_parts(remover, None)
    }

    /// Create a manager that recomputes the digest of every ingested content
    /// with `algorithm` and rejects content not matching its declared digest.
    pub fn with_digest_verification(algorithm: Arc<dyn DigestAlgorithm>) -> Self {
        Self::from_parts(Arc::new(StdFileRemover), Some(algorithm))
    }

    fn from_parts(
        remover: Arc<dyn FileRemover>,
        verifier: Option<Arc<dyn DigestAlgorithm>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                folder_ops: tokio::sync::Mutex::new(()),
                remover,
                verifier,
            }),
        }
    }

    /// Status of every registered storage folder, ordered by effective path.
    pub fn folder_status(&self) -> Vec<StorageFolderStatus> {
        self.shared
            .state
            .lock()
            .folders
            .values()
            .map(|folder| folder.status())
            .collect()
    }
}
