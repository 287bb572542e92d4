use std::path::{Path, PathBuf};
use std::sync::Arc;

use blob_store::{BlobStoreError, FileBlobManager, Sha256Prefix, StorageFolderConfig};
use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;

pub const DEFAULT_CONFIG_FILE_NAME: &str = "blobctl.toml";

/// Deployment configuration of the blob store driven by `blobctl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Storage folders the store should end up with
    #[serde(default)]
    pub folders: Vec<StorageFolderConfig>,
    /// Where the registry snapshot is kept between runs
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Reject added content that does not hash to its declared digest
    /// (SHA-256 prefix)
    #[serde(default)]
    pub verify_digests: bool,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            folders: Vec::new(),
            snapshot_path: None,
            log_level: default_log_level(),
            verify_digests: false,
        }
    }
}

impl ServiceConfig {
    /// Load the configuration. A missing default file means an empty store.
    pub fn load(custom_path: Option<&Path>) -> Result<Self, StateError> {
        let path = match custom_path {
            Some(path) => path,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE_NAME);
                if !path.exists() {
                    return Ok(Self::default());
                }
                path
            }
        };
        let config_toml = std::fs::read_to_string(path)?;
        Self::from_toml(&config_toml)
    }

    pub fn from_toml(config_toml: &str) -> Result<Self, StateError> {
        let config: Self = toml::from_str(config_toml)?;
        config.log_level()?;
        Ok(config)
    }

    pub fn log_level(&self) -> Result<LevelFilter, StateError> {
        self.log_level
            .parse()
            .map_err(|_| StateError::InvalidLogLevel(self.log_level.clone()))
    }
}

/// Bring up the store: restore the last snapshot, then make the registered
/// folders match the configuration.
pub async fn open_manager(config: &ServiceConfig) -> Result<FileBlobManager, StateError> {
    let manager = if config.verify_digests {
        FileBlobManager::with_digest_verification(Arc::new(Sha256Prefix))
    } else {
        FileBlobManager::new()
    };

    if let Some(snapshot_path) = &config.snapshot_path {
        if snapshot_path.exists() {
            let snapshot = FileBlobManager::read_snapshot(snapshot_path).await?;
            manager.load(snapshot).await?;
            tracing::info!(path = %snapshot_path.display(), "registry snapshot loaded");
        }
    }

    for folder in &config.folders {
        match manager.add_folder(folder.clone()).await {
            Ok(()) => {}
            Err(BlobStoreError::FolderAlreadyRegistered { .. }) => {
                manager.update_folder(folder.clone()).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let wanted: Vec<PathBuf> = config.folders.iter().map(|f| comparable(&f.path)).collect();
    for status in manager.folder_status() {
        if !wanted.contains(&comparable(&status.path)) {
            tracing::info!(path = %status.path.display(), "folder no longer configured, removing");
            manager.remove_folder(&status.path).await?;
        }
    }

    Ok(manager)
}

/// Save everything the next [`open_manager`] needs.
pub async fn close_manager(
    manager: &FileBlobManager,
    config: &ServiceConfig,
) -> Result<(), StateError> {
    if let Some(snapshot_path) = &config.snapshot_path {
        manager.write_snapshot(snapshot_path).await?;
    }
    manager.persist_folder_states().await?;
    Ok(())
}

fn comparable(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("blob store error: {0}")]
    Store(#[from] BlobStoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}
