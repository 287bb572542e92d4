//! Snapshots of the registry, per-folder metadata and recovery of both.
//!
//! Whatever the source of the records (a registry snapshot or a folder's
//! `metadata.json`), they are checked against the files on disk before being
//! trusted, and every other file found in the folder is deleted or, failing
//! that, counted as a zombie.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::InflateReader;
use crate::digest::Digest;
use crate::error::{BlobStoreError, Result};
use crate::events;
use crate::folder::{
    blob_relative_path_string, effective_path, parse_blob_relative_path, same_directory,
    StorageFolder, METADATA_FILE_NAME,
};
use crate::manager::FileBlobManager;
use crate::registry::{BlobEntry, State};
use crate::remover::{remove_off_thread, FileRemover};

/// Persisted description of a file blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub id: Uuid,
    pub digest: Digest,
    pub compressed_size: u64,
    pub size: u64,
    /// Path of the blob file relative to its folder, `/` separated
    pub relative_path: String,
    /// False if the blob was still being written
    pub ready: bool,
}

/// Persisted state of a storage folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderSnapshot {
    pub path: PathBuf,
    pub maximum_size: u64,
    pub blobs: Vec<BlobRecord>,
}

/// Persisted state of a whole [`FileBlobManager`].
///
/// Reference counts are not part of it: they belong to the consumers of the
/// blobs, which re-establish them after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub folders: Vec<FolderSnapshot>,
}

/// Content of a folder's `metadata.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FolderIndex {
    blobs: Vec<BlobRecord>,
}

/// A folder checked against the disk, ready to be added to the registry.
pub(crate) struct StagedFolder {
    pub folder: StorageFolder,
    pub blobs: Vec<BlobEntry>,
}

impl StagedFolder {
    pub fn commit(self, state: &mut State) {
        let path = self.folder.path.clone();
        state.folders.insert(path, self.folder);
        for entry in self.blobs {
            state.insert_blob(entry);
        }
    }
}

fn record_of(entry: &BlobEntry) -> BlobRecord {
    BlobRecord {
        id: entry.id,
        digest: entry.digest,
        compressed_size: entry.compressed_size,
        size: entry.size,
        relative_path: blob_relative_path_string(&entry.id),
        ready: entry.ready,
    }
}

fn folder_records(state: &State, folder: &StorageFolder) -> Vec<BlobRecord> {
    folder
        .blob_ids()
        .filter_map(|id| state.blobs.get(id))
        .map(record_of)
        .collect()
}

async fn write_json_atomically<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let mut temporary = path.as_os_str().to_owned();
    temporary.push(".tmp");
    let temporary = PathBuf::from(temporary);
    tokio::fs::write(&temporary, json).await?;
    tokio::fs::rename(&temporary, path).await?;
    Ok(())
}

/// Read a folder's `metadata.json`. `None` if the folder has none, meaning
/// it was never registered.
pub(crate) async fn read_folder_index(folder: &Path) -> Result<Option<Vec<BlobRecord>>> {
    match tokio::fs::read(folder.join(METADATA_FILE_NAME)).await {
        Ok(json) => {
            let index: FolderIndex = serde_json::from_slice(&json)?;
            Ok(Some(index.blobs))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Record that `folder` holds no blob.
pub(crate) async fn write_empty_folder_index(folder: &Path) -> Result<()> {
    write_json_atomically(&folder.join(METADATA_FILE_NAME), &FolderIndex::default()).await
}

/// Whether any file lies under `directory`, however deep.
pub(crate) async fn contains_files(directory: &Path) -> io::Result<bool> {
    let mut pending = vec![directory.to_path_buf()];
    while let Some(directory) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                pending.push(entry.path());
            } else {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Check `record` against its file. Returns the entry to index, or `None` if
/// the record has to be dropped.
async fn validate_record(folder: &StorageFolder, record: &BlobRecord) -> Option<BlobEntry> {
    if parse_blob_relative_path(Path::new(&record.relative_path)) != Some(record.id) {
        warn!(
            id = %record.id,
            relative_path = %record.relative_path,
            "ignoring file blob record with an unexpected path"
        );
        return None;
    }
    let path = folder.blob_path(&record.id);
    let metadata = match tokio::fs::metadata(&path).await {
        Ok(metadata) => metadata,
        Err(e) => {
            if record.ready {
                error!(
                    event = events::BLOB_MISSING_ON_LOAD,
                    id = %record.id,
                    path = %path.display(),
                    error = %e,
                    "file blob is missing"
                );
            } else {
                warn!(
                    event = events::NOT_READY_BLOB_DISCARDED,
                    id = %record.id,
                    path = %path.display(),
                    "discarding file blob that was never completed"
                );
            }
            return None;
        }
    };

    let mut entry = BlobEntry::new(record.id, record.digest, record.size, folder.path.clone());
    if record.ready {
        if metadata.len() != record.compressed_size {
            error!(
                event = events::BLOB_SIZE_MISMATCH_ON_LOAD,
                id = %record.id,
                path = %path.display(),
                expected = record.compressed_size,
                actual = metadata.len(),
                "file blob does not have the expected size"
            );
            return None;
        }
    } else {
        let decompressed = match InflateReader::open(&path).await {
            Ok(reader) => reader.count_to_end().await.ok(),
            Err(_) => None,
        };
        if decompressed != Some(record.size) {
            warn!(
                event = events::NOT_READY_BLOB_DISCARDED,
                id = %record.id,
                path = %path.display(),
                "discarding file blob that was never completed"
            );
            return None;
        }
        warn!(
            event = events::NOT_READY_BLOB_RECOVERED,
            id = %record.id,
            path = %path.display(),
            "file blob was completed after its record was saved"
        );
    }
    entry.compressed_size = metadata.len();
    entry.ready = true;
    Some(entry)
}

/// Delete every file of `folder` that is neither its metadata nor in `keep`,
/// then every empty sub-directory. Files that cannot be deleted are counted
/// as zombies.
async fn sweep_folder(
    remover: &Arc<dyn FileRemover>,
    folder: &mut StorageFolder,
    keep: &HashSet<PathBuf>,
) -> io::Result<()> {
    let metadata_path = folder.metadata_path();
    let mut pending = vec![folder.path.clone()];
    let mut directories = Vec::new();
    while let Some(directory) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path.clone());
                directories.push(path);
                continue;
            }
            if path == metadata_path || keep.contains(&path) {
                continue;
            }
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            match remove_off_thread(remover, &path).await {
                Ok(()) => debug!(path = %path.display(), "deleted leftover file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    error!(
                        event = events::ZOMBIE_DELETE_FAILED,
                        path = %path.display(),
                        size,
                        error = %e,
                        "failed to delete leftover file, it will be retried on next registration of its folder"
                    );
                    folder.count_zombie(size);
                }
            }
        }
    }
    // Deepest first, so parents emptied by their children go as well.
    for directory in directories.iter().rev() {
        let _ = tokio::fs::remove_dir(directory).await;
    }
    Ok(())
}

/// Validate `records` against the content of `path` and sweep everything
/// else out of it.
pub(crate) async fn stage_folder(
    remover: &Arc<dyn FileRemover>,
    user_path: PathBuf,
    path: PathBuf,
    maximum_size: u64,
    records: Vec<BlobRecord>,
) -> Result<StagedFolder> {
    let mut folder = StorageFolder::new(user_path, path, maximum_size);
    let mut blobs = Vec::with_capacity(records.len());
    let mut keep = HashSet::with_capacity(records.len());
    for record in &records {
        if blobs.iter().any(|b: &BlobEntry| b.id == record.id) {
            continue;
        }
        if let Some(entry) = validate_record(&folder, record).await {
            keep.insert(folder.blob_path(&entry.id));
            blobs.push(entry);
        }
    }
    sweep_folder(remover, &mut folder, &keep).await?;
    Ok(StagedFolder { folder, blobs })
}

/// Fail if `path` (or a directory it aliases) is already registered.
pub(crate) fn check_not_registered(
    folders: impl IntoIterator<Item = (PathBuf, PathBuf)>,
    user_path: &Path,
    path: &Path,
) -> Result<()> {
    for (existing_user_path, existing) in folders {
        if existing == path || same_directory(&existing, path) {
            return Err(BlobStoreError::FolderAlreadyRegistered {
                path: user_path.to_path_buf(),
                existing: existing_user_path,
            });
        }
    }
    Ok(())
}

/// Fail if one of `records` is already indexed by another folder.
pub(crate) fn check_index_conflicts<'a>(
    indexed: &HashMap<Uuid, PathBuf>,
    user_path: &Path,
    records: impl IntoIterator<Item = &'a BlobRecord>,
) -> Result<()> {
    for record in records {
        if let Some(existing) = indexed.get(&record.id) {
            error!(
                event = events::FOLDER_INDEX_CONFLICT,
                id = %record.id,
                folder = %user_path.display(),
                existing = %existing.display(),
                "file blob is already indexed by another storage folder"
            );
            return Err(BlobStoreError::IndexConflict {
                folder: user_path.to_path_buf(),
                id: record.id,
                existing: existing.clone(),
            });
        }
    }
    Ok(())
}

impl FileBlobManager {
    /// Capture the registry: every folder with the records of its blobs.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.shared.state.lock();
        let folders = state
            .folders
            .values()
            .map(|folder| FolderSnapshot {
                path: folder.user_path.clone(),
                maximum_size: folder.maximum_size,
                blobs: folder_records(&state, folder),
            })
            .collect();
        RegistrySnapshot { folders }
    }

    /// Write [`Self::snapshot`] to `path` as JSON, replacing it atomically.
    pub async fn write_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = self.snapshot();
        write_json_atomically(path.as_ref(), &snapshot).await?;
        debug!(path = %path.as_ref().display(), folders = snapshot.folders.len(), "registry snapshot written");
        Ok(())
    }

    /// Read a snapshot written by [`Self::write_snapshot`].
    pub async fn read_snapshot(path: impl AsRef<Path>) -> Result<RegistrySnapshot> {
        let json = tokio::fs::read(path.as_ref()).await?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Rebuild the registry from `snapshot`, registering its folders.
    ///
    /// Records are checked against the disk: missing or damaged blobs are
    /// dropped, blobs completed after the snapshot was taken are recovered and
    /// files nobody knows about are deleted (or become zombies).
    ///
    /// Must be called before any folder is registered.
    pub async fn load(&self, snapshot: RegistrySnapshot) -> Result<()> {
        let _ops = self.shared.folder_ops.lock().await;
        if !self.shared.state.lock().is_empty() {
            return Err(BlobStoreError::RegistryPopulated);
        }

        let mut staged: Vec<StagedFolder> = Vec::with_capacity(snapshot.folders.len());
        let mut indexed = HashMap::new();
        for folder in snapshot.folders {
            tokio::fs::create_dir_all(&folder.path).await?;
            let path = effective_path(&folder.path)?;
            check_not_registered(
                staged
                    .iter()
                    .map(|s| (s.folder.user_path.clone(), s.folder.path.clone())),
                &folder.path,
                &path,
            )?;
            check_index_conflicts(&indexed, &folder.path, &folder.blobs)?;
            indexed.extend(folder.blobs.iter().map(|b| (b.id, folder.path.clone())));
            staged.push(
                stage_folder(
                    &self.shared.remover,
                    folder.path,
                    path,
                    folder.maximum_size,
                    folder.blobs,
                )
                .await?,
            );
        }

        let mut state = self.shared.state.lock();
        if !state.is_empty() {
            return Err(BlobStoreError::RegistryPopulated);
        }
        for folder in staged {
            info!(
                path = %folder.folder.user_path.display(),
                blobs = folder.blobs.len(),
                "storage folder loaded"
            );
            folder.commit(&mut state);
        }
        Ok(())
    }

    /// Write the `metadata.json` of every folder whose content changed since
    /// it was last written.
    pub async fn persist_folder_states(&self) -> Result<()> {
        let pending: Vec<(PathBuf, FolderIndex)> = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let mut pending = Vec::new();
            for folder in state.folders.values() {
                if folder.needs_saving() {
                    let blobs = folder_records(state, folder);
                    pending.push((folder.path.clone(), FolderIndex { blobs }));
                }
            }
            for (path, _) in &pending {
                if let Some(folder) = state.folders.get_mut(path) {
                    folder.set_saved(true);
                }
            }
            pending
        };

        let mut result = Ok(());
        for (path, index) in pending {
            if let Err(e) = write_json_atomically(&path.join(METADATA_FILE_NAME), &index).await {
                warn!(path = %path.display(), error = %e, "failed to save storage folder metadata");
                {
                    let mut state = self.shared.state.lock();
                    if let Some(folder) = state.folders.get_mut(&path) {
                        folder.set_saved(false);
                    }
                }
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// `(user path, effective path)` of every registered folder.
    pub(crate) fn registered_folders(&self) -> Vec<(PathBuf, PathBuf)> {
        self.shared
            .state
            .lock()
            .folders
            .values()
            .map(|f| (f.user_path.clone(), f.path.clone()))
            .collect()
    }

    /// Owning folder (user path) of every indexed blob.
    pub(crate) fn indexed_blobs(&self) -> HashMap<Uuid, PathBuf> {
        let state = self.shared.state.lock();
        state
            .blobs
            .values()
            .filter_map(|entry| {
                state
                    .folders
                    .get(&entry.folder)
                    .map(|folder| (entry.id, folder.user_path.clone()))
            })
            .collect()
    }
}
