//! In-memory index of storage folders and file blobs.
//!
//! Everything in here is only ever touched with the manager's state mutex
//! held. Waiting for a blob to change (become ready, get unlocked, go away) is
//! done by subscribing to the entry's signal under the lock and awaiting it
//! after the lock is released.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tokio::sync::watch;
use uuid::Uuid;

use crate::digest::Digest;
use crate::folder::StorageFolder;

/// Registry record of a file blob.
#[derive(Debug)]
pub(crate) struct BlobEntry {
    pub id: Uuid,
    pub digest: Digest,
    /// Bytes accounted in the owning folder (the declared length while the
    /// blob is being written)
    pub compressed_size: u64,
    pub size: u64,
    pub reference_count: u64,
    pub lock_count: u32,
    pub ready: bool,
    /// Last reference dropped, deletion waits for the locks
    pub pending_deletion: bool,
    /// Effective path of the owning folder
    pub folder: PathBuf,
    signal: watch::Sender<()>,
}

impl BlobEntry {
    pub fn new(id: Uuid, digest: Digest, size: u64, folder: PathBuf) -> Self {
        let (signal, _) = watch::channel(());
        Self {
            id,
            digest,
            compressed_size: size,
            size,
            reference_count: 0,
            lock_count: 0,
            ready: false,
            pending_deletion: false,
            folder,
            signal,
        }
    }

    /// Receiver woken on the next [`Self::notify`] or when the entry is
    /// dropped from the registry.
    pub fn subscribe(&self) -> watch::Receiver<()> {
        self.signal.subscribe()
    }

    pub fn notify(&self) {
        self.signal.send_replace(());
    }
}

/// Wait for a signal obtained with [`BlobEntry::subscribe`].
pub(crate) async fn wait_for_change(mut rx: watch::Receiver<()>) {
    // An error means the entry is gone, which is a change as well.
    let _ = rx.changed().await;
}

#[derive(Debug, Default)]
pub(crate) struct State {
    /// Registered folders keyed (and ordered) by effective path
    pub folders: BTreeMap<PathBuf, StorageFolder>,
    pub blobs: HashMap<Uuid, BlobEntry>,
    by_digest: HashMap<Digest, Vec<Uuid>>,
}

impl State {
    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.blobs.is_empty()
    }

    /// Index a blob and account its `compressed_size` in its folder.
    pub fn insert_blob(&mut self, entry: BlobEntry) {
        if let Some(folder) = self.folders.get_mut(&entry.folder) {
            folder.add_blob(entry.id, entry.compressed_size);
        }
        self.by_digest.entry(entry.digest).or_default().push(entry.id);
        self.blobs.insert(entry.id, entry);
    }

    /// Remove a blob from every index and from its folder's accounting. The
    /// returned entry's signal wakes every waiter once it is dropped.
    pub fn remove_blob(&mut self, id: &Uuid) -> Option<BlobEntry> {
        let entry = self.blobs.remove(id)?;
        if let Some(ids) = self.by_digest.get_mut(&entry.digest) {
            ids.retain(|candidate| candidate != id);
            if ids.is_empty() {
                self.by_digest.remove(&entry.digest);
            }
        }
        if let Some(folder) = self.folders.get_mut(&entry.folder) {
            folder.remove_blob(id, entry.compressed_size);
        }
        Some(entry)
    }

    /// Blobs declared with `digest`, oldest first.
    pub fn candidates(&self, digest: &Digest) -> impl Iterator<Item = &BlobEntry> {
        self.by_digest
            .get(digest)
            .into_iter()
            .flatten()
            .filter_map(|id| self.blobs.get(id))
    }

    pub fn blob_path(&self, entry: &BlobEntry) -> PathBuf {
        match self.folders.get(&entry.folder) {
            Some(folder) => folder.blob_path(&entry.id),
            None => entry.folder.join(crate::folder::blob_relative_path(&entry.id)),
        }
    }

    /// Folder with the most free space able to hold `bytes`, skipping
    /// `excluding`. Ties go to the folder whose path sorts first.
    pub fn folder_for(&self, bytes: u64, excluding: Option<&Path>) -> Option<PathBuf> {
        let mut best: Option<&StorageFolder> = None;
        for folder in self.folders.values() {
            if Some(folder.path.as_path()) == excluding || folder.free_space() < bytes {
                continue;
            }
            if best.map_or(true, |b| folder.free_space() > b.free_space()) {
                best = Some(folder);
            }
        }
        best.map(|folder| folder.path.clone())
    }

    /// Largest free space of a single folder, for error reporting.
    pub fn largest_free_space(&self, excluding: Option<&Path>) -> u64 {
        self.folders
            .values()
            .filter(|folder| Some(folder.path.as_path()) != excluding)
            .map(StorageFolder::free_space)
            .max()
            .unwrap_or(0)
    }

    /// Total free space of every folder but `excluding`.
    pub fn total_free_space(&self, excluding: &Path) -> u64 {
        self.folders
            .values()
            .filter(|folder| folder.path != excluding)
            .map(StorageFolder::free_space)
            .sum()
    }
}

/// A file dropped from the registry. It is deleted once the state lock is
/// released, and becomes a zombie of `folder` if that fails.
#[derive(Debug)]
pub(crate) struct Discard {
    pub folder: PathBuf,
    pub path: PathBuf,
    /// Accounted size when the file cannot be inspected
    pub fallback_size: u64,
}
