//! Storage folders: capacity accounting and the on-disk blob path convention.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Component, Path, PathBuf};

use uuid::Uuid;

use crate::config::StorageFolderStatus;

/// Name of the per-folder index written by `persist_folder_states`.
pub(crate) const METADATA_FILE_NAME: &str = "metadata.json";

/// Path of a blob file relative to its storage folder: `ab/cd/abcd....`,
/// where the two directory levels are the first four characters of the id.
pub(crate) fn blob_relative_path(id: &Uuid) -> PathBuf {
    let name = id.hyphenated().to_string();
    PathBuf::from(&name[0..2]).join(&name[2..4]).join(name)
}

/// Same as [`blob_relative_path`] with `/` separators, for serialized records.
pub(crate) fn blob_relative_path_string(id: &Uuid) -> String {
    let name = id.hyphenated().to_string();
    format!("{}/{}/{}", &name[0..2], &name[2..4], name)
}

/// Inverse of [`blob_relative_path`]: returns the id when `relative` follows
/// the convention exactly.
pub(crate) fn parse_blob_relative_path(relative: &Path) -> Option<Uuid> {
    let parts: Vec<&str> = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    let [first, second, name] = parts.as_slice() else {
        return None;
    };
    let id = Uuid::parse_str(name).ok()?;
    let canonical = id.hyphenated().to_string();
    (*name == canonical && *first == &canonical[0..2] && *second == &canonical[2..4]).then_some(id)
}

/// Resolve the path a storage folder is keyed by: absolute, with `.`/`..`
/// resolved, and with symbolic links resolved when the directory exists.
pub(crate) fn effective_path(path: &Path) -> io::Result<PathBuf> {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return Ok(canonical);
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}

/// Do two existing paths name the same directory (hard aliases, bind mounts,
/// different case on case-insensitive file systems)?
#[cfg(unix)]
pub(crate) fn same_directory(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
pub(crate) fn same_directory(_a: &Path, _b: &Path) -> bool {
    false
}

/// Runtime state of a registered storage folder.
///
/// `size` always equals the compressed size of the blobs the folder owns,
/// plus zombies, plus reservations for blobs being copied into it.
#[derive(Debug)]
pub(crate) struct StorageFolder {
    /// Path as provided by the configuration owner
    pub user_path: PathBuf,
    /// Effective path, key of the folder in the registry
    pub path: PathBuf,
    pub maximum_size: u64,
    size: u64,
    zombies_size: u64,
    blobs: BTreeSet<Uuid>,
    incoming: HashMap<Uuid, u64>,
    dirty: bool,
}

impl StorageFolder {
    pub fn new(user_path: PathBuf, path: PathBuf, maximum_size: u64) -> Self {
        Self {
            user_path,
            path,
            maximum_size,
            size: 0,
            zombies_size: 0,
            blobs: BTreeSet::new(),
            incoming: HashMap::new(),
            dirty: true,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn zombies_size(&self) -> u64 {
        self.zombies_size
    }

    pub fn free_space(&self) -> u64 {
        self.maximum_size.saturating_sub(self.size)
    }

    pub fn blob_ids(&self) -> impl Iterator<Item = &Uuid> {
        self.blobs.iter()
    }

    pub fn blob_path(&self, id: &Uuid) -> PathBuf {
        self.path.join(blob_relative_path(id))
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.path.join(METADATA_FILE_NAME)
    }

    pub fn add_blob(&mut self, id: Uuid, compressed_size: u64) {
        if self.blobs.insert(id) {
            self.size += compressed_size;
            self.dirty = true;
        }
    }

    pub fn remove_blob(&mut self, id: &Uuid, compressed_size: u64) {
        if self.blobs.remove(id) {
            self.size = self.size.saturating_sub(compressed_size);
            self.dirty = true;
        }
    }

    /// Replace the accounted size of a blob (reservation -> real size).
    pub fn resize_blob(&mut self, reserved: u64, actual: u64) {
        self.size = self.size.saturating_sub(reserved) + actual;
        self.dirty = true;
    }

    /// Reserve room for a blob being copied into this folder.
    pub fn reserve_incoming(&mut self, id: Uuid, compressed_size: u64) {
        if self.incoming.insert(id, compressed_size).is_none() {
            self.size += compressed_size;
        }
    }

    /// Drop a reservation made by [`Self::reserve_incoming`] without
    /// releasing its bytes (they either become owned or become a zombie).
    pub fn take_incoming(&mut self, id: &Uuid) -> Option<u64> {
        self.incoming.remove(id)
    }

    /// Release bytes previously reserved and taken back with
    /// [`Self::take_incoming`].
    pub fn release(&mut self, bytes: u64) {
        self.size = self.size.saturating_sub(bytes);
    }

    /// Adopt a blob whose incoming reservation was already taken.
    pub fn adopt_blob(&mut self, id: Uuid) {
        self.blobs.insert(id);
        self.dirty = true;
    }

    /// Account for a file that could not be deleted.
    pub fn count_zombie(&mut self, bytes: u64) {
        self.zombies_size += bytes;
        self.size += bytes;
    }

    pub fn needs_saving(&self) -> bool {
        self.dirty
    }

    pub fn set_saved(&mut self, saved: bool) {
        self.dirty = !saved;
    }

    pub fn status(&self) -> StorageFolderStatus {
        StorageFolderStatus {
            path: self.user_path.clone(),
            current_size: self.size,
            zombies_size: self.zombies_size,
            maximum_size: self.maximum_size,
        }
    }
}
