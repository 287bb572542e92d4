//! Shared test utilities for file blob manager integration tests
#![allow(dead_code)]

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blob_store::{Digest, FileBlobManager, FileRemover, StorageFolderStatus};
use parking_lot::{Condvar, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::subscriber::DefaultGuard;
use uuid::Uuid;

pub const CONTENT: &[u8] = b"This is the file content";

/// A temporary directory, with its canonical path so it can be compared
/// with the paths the manager works with.
pub fn temp_dir() -> (TempDir, PathBuf) {
    let temp = TempDir::new().unwrap();
    let path = temp.path().canonicalize().unwrap();
    (temp, path)
}

pub fn digest(seed: u8) -> Digest {
    Digest::new([seed; 16])
}

pub async fn add(manager: &FileBlobManager, content: &[u8], digest: Digest) -> Uuid {
    manager
        .add_blob(content, content.len() as u64, digest, &CancellationToken::new())
        .await
        .unwrap()
}

pub fn status_of(manager: &FileBlobManager, path: &Path) -> StorageFolderStatus {
    manager
        .folder_status()
        .into_iter()
        .find(|status| status.path == path)
        .unwrap_or_else(|| panic!("{} is not registered", path.display()))
}

/// Where a blob file lives inside its storage folder.
pub fn blob_file(folder: &Path, id: Uuid) -> PathBuf {
    let name = id.hyphenated().to_string();
    folder.join(&name[0..2]).join(&name[2..4]).join(name)
}

/// Every file below `dir`, the metadata file excluded.
pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else if path.file_name() != Some("metadata.json".as_ref()) {
                files.push(path);
            }
        }
    }
    files
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Removes files like the default remover, except the denied ones.
#[derive(Debug, Default)]
pub struct DenyRemoval {
    denied: Mutex<HashSet<PathBuf>>,
}

impl DenyRemoval {
    pub fn deny(&self, path: impl Into<PathBuf>) {
        self.denied.lock().insert(path.into());
    }

    pub fn allow_all(&self) {
        self.denied.lock().clear();
    }
}

impl FileRemover for DenyRemoval {
    fn remove_file(&self, path: &Path) -> io::Result<()> {
        if self.denied.lock().contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "removal denied by test",
            ));
        }
        std::fs::remove_file(path)
    }
}

/// Holds every removal until [`GatedRemoval::open`] is called.
#[derive(Debug, Default)]
pub struct GatedRemoval {
    open: Mutex<bool>,
    opened: Condvar,
    waiting: AtomicBool,
}

impl GatedRemoval {
    pub fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }

    /// Whether a removal is waiting for the gate.
    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }
}

impl FileRemover for GatedRemoval {
    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.waiting.store(true, Ordering::SeqCst);
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
        std::fs::remove_file(path)
    }
}

pub fn manager_denying_removal() -> (FileBlobManager, Arc<DenyRemoval>) {
    let remover = Arc::new(DenyRemoval::default());
    let manager = FileBlobManager::with_remover(remover.clone());
    (manager, remover)
}

/// In-memory sink for the log records of the current thread.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Capture the logs of the current thread (and so of a current-thread
    /// runtime) until the guard is dropped.
    pub fn install() -> (Self, DefaultGuard) {
        let capture = Self::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        (capture, tracing::subscriber::set_default(subscriber))
    }

    /// Number of log records carrying `event`.
    pub fn count(&self, event: &str) -> usize {
        String::from_utf8_lossy(&self.0.lock())
            .lines()
            .filter(|line| line.contains(event))
            .count()
    }
}

impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
