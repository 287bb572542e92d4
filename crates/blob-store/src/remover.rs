//! Physical deletion of blob files.

use std::fmt::Debug;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Deletes files on behalf of the manager.
///
/// Every deletion the manager performs (reclaiming blobs, rolling back failed
/// ingestions, sweeping leftovers) goes through this trait. A failed deletion
/// turns the file into a zombie: it stays counted against its folder until a
/// later registration of the folder manages to delete it.
pub trait FileRemover: Debug + Send + Sync {
    fn remove_file(&self, path: &Path) -> io::Result<()>;
}

/// Removes files with `std::fs::remove_file`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFileRemover;

impl FileRemover for StdFileRemover {
    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }
}

/// Run `remover` on the blocking pool.
pub(crate) async fn remove_off_thread(remover: &Arc<dyn FileRemover>, path: &Path) -> io::Result<()> {
    let remover = Arc::clone(remover);
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || remover.remove_file(&path))
        .await
        .unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e)))
}
