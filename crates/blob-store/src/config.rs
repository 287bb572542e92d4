use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration of a storage folder, supplied by whoever owns the
/// deployment configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageFolderConfig {
    /// Where blob files are stored
    pub path: PathBuf,
    /// Maximum number of bytes the folder's blob files may use
    pub maximum_size: u64,
}

impl StorageFolderConfig {
    pub fn new(path: impl Into<PathBuf>, maximum_size: u64) -> Self {
        Self {
            path: path.into(),
            maximum_size,
        }
    }
}

/// Point-in-time status of a storage folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageFolderStatus {
    /// Path as it was provided when the folder was registered
    pub path: PathBuf,
    /// Compressed bytes of every file in the folder, zombies included
    pub current_size: u64,
    /// Bytes held by files that could not be deleted
    pub zombies_size: u64,
    pub maximum_size: u64,
}
