//! Registration, resizing and removal of storage folders.
//!
//! These operations are queued behind `folder_ops` and run one at a time.
//! Shrinking and removing a folder move blobs out of it concurrently, each
//! move waiting for its blob to be written and unlocked before it completes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::StorageFolderConfig;
use crate::error::{BlobStoreError, Result};
use crate::events;
use crate::folder::{effective_path, same_directory};
use crate::manager::{FileBlobManager, Shared};
use crate::persistence::{
    check_index_conflicts, check_not_registered, contains_files, read_folder_index, stage_folder,
    write_empty_folder_index,
};
use crate::registry::{wait_for_change, Discard, State};

/// Pick blobs of `source` adding up to at least `to_free` bytes that the
/// other folders can take, largest first.
fn plan_evacuation(state: &State, source: &Path, to_free: u64) -> Option<Vec<Uuid>> {
    let mut free: Vec<u64> = state
        .folders
        .values()
        .filter(|folder| folder.path != source)
        .map(|folder| folder.free_space())
        .collect();
    let mut blobs: Vec<(u64, Uuid)> = state
        .folders
        .get(source)?
        .blob_ids()
        .filter_map(|id| state.blobs.get(id))
        .map(|entry| (entry.compressed_size, entry.id))
        .collect();
    blobs.sort_unstable_by(|a, b| b.cmp(a));

    let mut freed = 0u64;
    let mut plan = Vec::new();
    for (size, id) in blobs {
        if freed >= to_free {
            break;
        }
        if let Some(slot) = free.iter_mut().filter(|f| **f >= size).max() {
            *slot -= size;
            freed += size;
            plan.push(id);
        }
    }
    (freed >= to_free).then_some(plan)
}

impl FileBlobManager {
    /// Register a storage folder.
    ///
    /// The directory is created if needed. If it already holds blobs (listed
    /// in its `metadata.json`) they are indexed after being checked against
    /// the disk; any other file is deleted or, failing that, counted as a
    /// zombie. A directory without `metadata.json` was never a storage
    /// folder, and must not contain any file.
    ///
    /// # Errors
    /// * [`BlobStoreError::FolderNotEmpty`] if the directory has files but no
    ///   `metadata.json`; nothing is deleted
    /// * [`BlobStoreError::FolderAlreadyRegistered`] if the folder, or a path
    ///   naming the same directory, is already registered
    /// * [`BlobStoreError::IndexConflict`] if one of its blobs is already
    ///   indexed by another folder, in which case nothing is registered
    pub async fn add_folder(&self, config: StorageFolderConfig) -> Result<()> {
        let _ops = self.shared.folder_ops.lock().await;

        tokio::fs::create_dir_all(&config.path).await?;
        let path = effective_path(&config.path)?;
        check_not_registered(self.registered_folders(), &config.path, &path)?;

        let records = match read_folder_index(&path).await? {
            Some(records) => records,
            None if contains_files(&path).await? => {
                return Err(BlobStoreError::FolderNotEmpty(config.path));
            }
            None => Vec::new(),
        };
        check_index_conflicts(&self.indexed_blobs(), &config.path, &records)?;

        let staged = stage_folder(
            &self.shared.remover,
            config.path.clone(),
            path,
            config.maximum_size,
            records,
        )
        .await?;

        let mut state = self.shared.state.lock();
        info!(
            path = %config.path.display(),
            maximum_size = config.maximum_size,
            blobs = staged.blobs.len(),
            zombies_size = staged.folder.zombies_size(),
            "storage folder added"
        );
        staged.commit(&mut state);
        Ok(())
    }

    /// Change the capacity of a registered storage folder, moving blobs to
    /// other folders when it shrinks below its current size.
    ///
    /// # Errors
    /// * [`BlobStoreError::IrreclaimableCapacity`] if zombies alone exceed the
    ///   new capacity
    /// * [`BlobStoreError::CapacityExhausted`] if the other folders cannot
    ///   take what has to move
    ///
    /// Both leave the folder untouched. An IO error while moving blobs keeps
    /// the moves that already completed.
    pub async fn update_folder(&self, config: StorageFolderConfig) -> Result<()> {
        let _ops = self.shared.folder_ops.lock().await;
        let path = self.resolve_folder(&config.path)?;

        loop {
            let moves = {
                let mut state = self.shared.state.lock();
                let folder = state
                    .folders
                    .get_mut(&path)
                    .ok_or_else(|| BlobStoreError::FolderNotFound(config.path.clone()))?;
                if folder.zombies_size() > config.maximum_size {
                    return Err(BlobStoreError::IrreclaimableCapacity {
                        path: config.path,
                        requested: config.maximum_size,
                        zombies: folder.zombies_size(),
                    });
                }
                if folder.size() <= config.maximum_size {
                    info!(
                        path = %config.path.display(),
                        from = folder.maximum_size,
                        to = config.maximum_size,
                        "storage folder resized"
                    );
                    folder.maximum_size = config.maximum_size;
                    return Ok(());
                }
                let to_free = folder.size() - config.maximum_size;
                plan_evacuation(&state, &path, to_free).ok_or_else(|| {
                    BlobStoreError::CapacityExhausted {
                        requested: to_free,
                        available: state.total_free_space(&path),
                    }
                })?
            };
            debug!(path = %config.path.display(), blobs = moves.len(), "moving blobs out of shrinking storage folder");
            self.migrate(&path, moves).await?;
        }
    }

    /// Move every blob out of a storage folder and unregister it.
    ///
    /// Blobs move as soon as they are written and unlocked; the call returns
    /// once all of them have moved. Zombies of the folder are forgotten.
    ///
    /// # Errors
    /// * [`BlobStoreError::CapacityExhausted`] if the other folders cannot
    ///   take the folder's blobs, leaving everything in place
    /// * [`BlobStoreError::Io`] if a blob cannot be copied; blobs already
    ///   moved stay moved and the folder stays registered
    pub async fn remove_folder(&self, path: impl AsRef<Path>) -> Result<()> {
        let _ops = self.shared.folder_ops.lock().await;
        let user_path = path.as_ref();
        let path = self.resolve_folder(user_path)?;

        loop {
            let ids = {
                let mut state = self.shared.state.lock();
                let folder = state
                    .folders
                    .get(&path)
                    .ok_or_else(|| BlobStoreError::FolderNotFound(user_path.to_path_buf()))?;
                let ids: Vec<Uuid> = folder.blob_ids().copied().collect();
                if ids.is_empty() {
                    if let Some(folder) = state.folders.remove(&path) {
                        info!(
                            path = %folder.user_path.display(),
                            zombies_size = folder.zombies_size(),
                            "storage folder removed"
                        );
                    }
                    break;
                }
                // Blobs still being written count for their declared size.
                let to_free = folder.size().saturating_sub(folder.zombies_size());
                if plan_evacuation(&state, &path, to_free).is_none() {
                    return Err(BlobStoreError::CapacityExhausted {
                        requested: to_free,
                        available: state.total_free_space(&path),
                    });
                }
                ids
            };
            debug!(path = %user_path.display(), blobs = ids.len(), "moving blobs out of removed storage folder");
            self.migrate(&path, ids).await?;
        }

        // The folder no longer owns anything, registering it again must not
        // claim the blobs that moved out.
        if let Err(e) = write_empty_folder_index(&path).await {
            warn!(path = %user_path.display(), error = %e, "failed to clear metadata of removed storage folder");
        }
        Ok(())
    }

    /// Effective path of a registered folder.
    fn resolve_folder(&self, user_path: &Path) -> Result<PathBuf> {
        let path = effective_path(user_path)?;
        let state = self.shared.state.lock();
        if state.folders.contains_key(&path) {
            return Ok(path);
        }
        state
            .folders
            .values()
            .find(|folder| folder.user_path == user_path || same_directory(&folder.path, &path))
            .map(|folder| folder.path.clone())
            .ok_or_else(|| BlobStoreError::FolderNotFound(user_path.to_path_buf()))
    }

    /// Move `ids` out of `source`, all at once. The first error abandons the
    /// moves still in progress.
    async fn migrate(&self, source: &Path, ids: Vec<Uuid>) -> Result<()> {
        let mut moves: FuturesUnordered<_> =
            ids.into_iter().map(|id| self.relocate(source, id)).collect();
        while let Some(result) = moves.next().await {
            result?;
        }
        Ok(())
    }

    async fn relocate(&self, source: &Path, id: Uuid) -> Result<()> {
        let mut relocation = loop {
            let rx = {
                let mut guard = self.shared.state.lock();
                let state = &mut *guard;
                let Some(entry) = state.blobs.get(&id) else {
                    return Ok(());
                };
                if entry.folder != source {
                    return Ok(());
                }
                if entry.ready {
                    let size = entry.compressed_size;
                    let from = state.blob_path(entry);
                    let destination = state.folder_for(size, Some(source)).ok_or_else(|| {
                        BlobStoreError::CapacityExhausted {
                            requested: size,
                            available: state.largest_free_space(Some(source)),
                        }
                    })?;
                    let Some(folder) = state.folders.get_mut(&destination) else {
                        return Err(BlobStoreError::FolderNotFound(destination));
                    };
                    folder.reserve_incoming(id, size);
                    let to = folder.blob_path(&id);
                    if let Some(entry) = state.blobs.get_mut(&id) {
                        entry.lock_count += 1;
                    }
                    break Relocation {
                        shared: Arc::clone(&self.shared),
                        id,
                        size,
                        source: source.to_path_buf(),
                        destination,
                        from,
                        to,
                        pinned: true,
                        done: false,
                    };
                }
                entry.subscribe()
            };
            wait_for_change(rx).await;
        };

        if let Err(e) = copy_file(&relocation.from, &relocation.to).await {
            error!(
                event = events::MIGRATION_COPY_FAILED,
                id = %id,
                from = %relocation.from.display(),
                to = %relocation.to.display(),
                error = %e,
                "failed to copy file blob to its new storage folder"
            );
            relocation.abandon().await;
            return Err(e.into());
        }
        relocation.unpin();

        let discard = loop {
            let rx = {
                let mut state = self.shared.state.lock();
                match state.blobs.get(&id) {
                    // Deleted while being copied, the copy goes too.
                    None => break relocation.cancel(&mut state),
                    Some(entry) if entry.lock_count > 0 => entry.subscribe(),
                    Some(_) => break relocation.conclude(&mut state),
                }
            };
            wait_for_change(rx).await;
        };
        self.shared.discard(discard).await;
        Ok(())
    }
}

async fn copy_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(from, to).await?;
    Ok(())
}

/// A blob being moved between folders. Until [`Relocation::conclude`] the
/// blob stays where it was; dropping the relocation before that discards the
/// copy and the room reserved for it.
struct Relocation {
    shared: Arc<Shared>,
    id: Uuid,
    size: u64,
    source: PathBuf,
    destination: PathBuf,
    from: PathBuf,
    to: PathBuf,
    pinned: bool,
    done: bool,
}

impl Relocation {
    fn unpin_locked(&mut self, state: &mut State) {
        if !self.pinned {
            return;
        }
        self.pinned = false;
        if let Some(entry) = state.blobs.get_mut(&self.id) {
            entry.lock_count = entry.lock_count.saturating_sub(1);
            if entry.lock_count == 0 {
                entry.notify();
            }
        }
    }

    fn unpin(&mut self) {
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        self.unpin_locked(&mut state);
    }

    /// Hand the blob over to the destination folder. The original is
    /// returned for deletion.
    fn conclude(&mut self, state: &mut State) -> Discard {
        self.done = true;
        let mut compressed_size = self.size;
        if let Some(entry) = state.blobs.get_mut(&self.id) {
            entry.folder = self.destination.clone();
            entry.notify();
            compressed_size = entry.compressed_size;
        }
        if let Some(folder) = state.folders.get_mut(&self.destination) {
            folder.take_incoming(&self.id);
            folder.adopt_blob(self.id);
        }
        if let Some(folder) = state.folders.get_mut(&self.source) {
            folder.remove_blob(&self.id, compressed_size);
        }
        debug!(
            id = %self.id,
            from = %self.from.display(),
            to = %self.to.display(),
            "file blob moved"
        );
        Discard {
            folder: self.source.clone(),
            path: self.from.clone(),
            fallback_size: compressed_size,
        }
    }

    /// Give the reserved room back. The copy is returned for deletion.
    fn cancel(&mut self, state: &mut State) -> Discard {
        self.done = true;
        self.unpin_locked(state);
        if let Some(folder) = state.folders.get_mut(&self.destination) {
            if let Some(reserved) = folder.take_incoming(&self.id) {
                folder.release(reserved);
            }
        }
        Discard {
            folder: self.destination.clone(),
            path: self.to.clone(),
            fallback_size: self.size,
        }
    }

    async fn abandon(mut self) {
        let shared = Arc::clone(&self.shared);
        let discard = self.cancel(&mut shared.state.lock());
        shared.discard(discard).await;
    }
}

impl Drop for Relocation {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let discard = self.cancel(&mut shared.state.lock());
        shared.discard_now(discard);
    }
}
