//! Ingestion of new content: compression into a new blob file, deduplicated
//! against blobs declared with the same digest.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::{Comparison, CompressWriter, InflateReader};
use crate::digest::Digest;
use crate::error::{BlobStoreError, Result};
use crate::events;
use crate::manager::{FileBlobManager, Shared};
use crate::registry::{wait_for_change, BlobEntry, Discard, State};

/// Bytes read from the ingested stream per step.
const INGEST_CHUNK_SIZE: usize = 256 * 1024;

impl FileBlobManager {
    /// Store `length` bytes read from `content` and return the id of a blob
    /// holding exactly those bytes.
    ///
    /// Blobs declared with the same `digest` and length are compared with the
    /// content while it is compressed; the first one found identical is
    /// returned instead of the new blob. The reference count of the returned
    /// blob is left untouched.
    ///
    /// # Errors
    /// * [`BlobStoreError::CapacityExhausted`] if no folder can hold `length`
    ///   bytes and no identical blob exists
    /// * [`BlobStoreError::Cancelled`] if `cancel` fires first
    /// * [`BlobStoreError::Io`] on any IO error, including `content` ending
    ///   before `length` bytes
    /// * [`BlobStoreError::DigestMismatch`] if the manager verifies digests
    ///   (see [`FileBlobManager::with_digest_verification`]) and the content
    ///   does not hash to `digest`
    ///
    /// On error nothing is left behind: no registry entry, no reserved
    /// capacity, no file (or a zombie if it cannot be deleted).
    pub async fn add_blob<R>(
        &self,
        content: R,
        length: u64,
        digest: Digest,
        cancel: &CancellationToken,
    ) -> Result<Uuid>
    where
        R: AsyncRead + Unpin + Send,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(digest = %digest, "file blob ingestion cancelled");
                Err(BlobStoreError::Cancelled)
            }
            result = self.ingest(content, length, digest) => result,
        }
    }

    async fn ingest<R>(&self, content: R, length: u64, digest: Digest) -> Result<Uuid>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut ingestion = loop {
            let rx = {
                let mut state = self.shared.state.lock();
                match self.begin_ingestion(&mut state, length, digest)? {
                    Begin::Started(ingestion) => break ingestion,
                    Begin::Wait(rx) => rx,
                }
            };
            // Same content may be in flight, its outcome decides ours.
            wait_for_change(rx).await;
        };

        match self.stream(&mut ingestion, content, length, digest).await {
            Ok(Outcome::Matched(id)) => {
                ingestion.rollback().await;
                debug!(id = %id, digest = %digest, "file blob deduplicated");
                Ok(id)
            }
            Ok(Outcome::Written(compressed_size)) => {
                let id = ingestion.commit(compressed_size);
                debug!(id = %id, digest = %digest, size = length, compressed_size, "file blob added");
                Ok(id)
            }
            Ok(Outcome::NoRoom) => {
                ingestion.rollback().await;
                let state = self.shared.state.lock();
                Err(BlobStoreError::CapacityExhausted {
                    requested: length,
                    available: state.largest_free_space(None),
                })
            }
            Err(e) => {
                ingestion.rollback().await;
                Err(e)
            }
        }
    }

    /// Read the content once, compressing it into the new blob file (if any)
    /// while comparing it with every candidate.
    async fn stream<R>(
        &self,
        ingestion: &mut Ingestion,
        content: R,
        length: u64,
        digest: Digest,
    ) -> Result<Outcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        for candidate in &mut ingestion.candidates {
            match InflateReader::open(&candidate.path).await {
                Ok(reader) => candidate.reader = Some(reader),
                Err(e) => candidate.unreadable(e),
            }
        }

        let mut writer = match &ingestion.target {
            Some(target) => Some(CompressWriter::create(&target.path).await?),
            None => None,
        };
        let mut hasher = self.shared.verifier.as_ref().map(|algorithm| algorithm.start());

        let mut content = content.take(length);
        let mut buffer = vec![0u8; INGEST_CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let read = content.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            total += read as u64;
            let chunk = &buffer[..read];
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(chunk);
            }
            if let Some(writer) = writer.as_mut() {
                writer.write(chunk).await?;
            }
            for candidate in &mut ingestion.candidates {
                candidate.compare(chunk).await;
            }
        }
        if total < length {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("content ended after {total} of {length} bytes"),
            )
            .into());
        }

        if let Some(hasher) = hasher {
            let actual = hasher.finish();
            if actual != digest {
                warn!(expected = %digest, actual = %actual, "rejecting content not matching its declared digest");
                return Err(BlobStoreError::DigestMismatch {
                    expected: digest,
                    actual,
                });
            }
        }

        for candidate in &mut ingestion.candidates {
            if candidate.conclude().await {
                return Ok(Outcome::Matched(candidate.id));
            }
        }
        match writer {
            Some(writer) => Ok(Outcome::Written(writer.finish().await?)),
            None => Ok(Outcome::NoRoom),
        }
    }

    /// Pin the candidates and reserve room for the new blob, or return what
    /// to wait for before trying again.
    fn begin_ingestion(&self, state: &mut State, length: u64, digest: Digest) -> Result<Begin> {
        let mut candidates = Vec::new();
        let same_length = state
            .candidates(&digest)
            .filter(|e| e.size == length && !e.pending_deletion);
        for entry in same_length {
            if !entry.ready {
                return Ok(Begin::Wait(entry.subscribe()));
            }
            candidates.push(entry.id);
        }

        let target = state.folder_for(length, None);
        if target.is_none() && candidates.is_empty() {
            return Err(BlobStoreError::CapacityExhausted {
                requested: length,
                available: state.largest_free_space(None),
            });
        }

        let mut ingestion = Ingestion {
            shared: Arc::clone(&self.shared),
            candidates: Vec::with_capacity(candidates.len()),
            target: None,
            done: false,
        };
        for id in candidates {
            if let Some(entry) = state.blobs.get_mut(&id) {
                entry.lock_count += 1;
                let entry = &state.blobs[&id];
                ingestion.candidates.push(Candidate {
                    id,
                    path: state.blob_path(entry),
                    reader: None,
                });
            }
        }
        if let Some(folder) = target {
            let id = Uuid::new_v4();
            let entry = BlobEntry::new(id, digest, length, folder.clone());
            let path = state.blob_path(&entry);
            state.insert_blob(entry);
            ingestion.target = Some(Target { id, folder, path });
        }
        Ok(Begin::Started(ingestion))
    }
}

enum Begin {
    Started(Ingestion),
    Wait(watch::Receiver<()>),
}

enum Outcome {
    /// An existing blob holds the same content
    Matched(Uuid),
    /// Compressed size of the new blob file
    Written(u64),
    NoRoom,
}

struct Target {
    id: Uuid,
    folder: PathBuf,
    path: PathBuf,
}

/// A ready blob with the same digest and length as the ingested content.
/// It stays a potential match as long as it has a reader.
struct Candidate {
    id: Uuid,
    path: PathBuf,
    reader: Option<InflateReader>,
}

impl Candidate {
    async fn compare(&mut self, chunk: &[u8]) {
        let Some(reader) = self.reader.as_mut() else {
            return;
        };
        match reader.compare(chunk).await {
            Ok(Comparison::Same) => {}
            Ok(Comparison::Differs) => {
                warn!(id = %self.id, "file blob shares its digest with different content");
                self.reader = None;
            }
            Ok(Comparison::Short) => {
                warn!(
                    event = events::BLOB_SHORTER_THAN_EXPECTED,
                    id = %self.id,
                    path = %self.path.display(),
                    "file blob was shorter than expected"
                );
                self.reader = None;
            }
            Err(e) => self.unreadable(e),
        }
    }

    /// Whether the candidate matched the whole content.
    async fn conclude(&mut self) -> bool {
        let Some(reader) = self.reader.as_mut() else {
            return false;
        };
        match reader.at_end().await {
            Ok(true) => true,
            Ok(false) => {
                warn!(
                    event = events::BLOB_LONGER_THAN_EXPECTED,
                    id = %self.id,
                    path = %self.path.display(),
                    "file blob was longer than expected"
                );
                self.reader = None;
                false
            }
            Err(e) => {
                self.unreadable(e);
                false
            }
        }
    }

    fn unreadable(&mut self, error: io::Error) {
        warn!(
            event = events::CANDIDATE_UNREADABLE,
            id = %self.id,
            path = %self.path.display(),
            error = %error,
            "failed to read file blob for comparison"
        );
        self.reader = None;
    }
}

/// Registry side of an ingestion in progress. Dropping it before
/// [`Ingestion::commit`] or [`Ingestion::rollback`] rolls everything back,
/// which is how cancellation is handled.
struct Ingestion {
    shared: Arc<Shared>,
    candidates: Vec<Candidate>,
    target: Option<Target>,
    done: bool,
}

impl Ingestion {
    fn unpin_candidates(&self, state: &mut State) {
        for candidate in &self.candidates {
            if let Some(entry) = state.blobs.get_mut(&candidate.id) {
                entry.lock_count = entry.lock_count.saturating_sub(1);
                if entry.lock_count == 0 {
                    entry.notify();
                }
            }
        }
    }

    /// Forget the new blob, returning its file for deletion.
    fn release(&mut self, state: &mut State) -> Option<Discard> {
        self.unpin_candidates(state);
        self.done = true;
        let target = self.target.as_ref()?;
        drop(state.remove_blob(&target.id));
        Some(Discard {
            folder: target.folder.clone(),
            path: target.path.clone(),
            fallback_size: 0,
        })
    }

    /// Promote the new blob, replacing its reservation with its real size.
    fn commit(mut self, compressed_size: u64) -> Uuid {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        self.unpin_candidates(state);
        let mut id = Uuid::nil();
        if let Some(target) = &self.target {
            id = target.id;
            if let Some(entry) = state.blobs.get_mut(&target.id) {
                let reserved = entry.compressed_size;
                entry.compressed_size = compressed_size;
                entry.ready = true;
                entry.notify();
                if let Some(folder) = state.folders.get_mut(&target.folder) {
                    folder.resize_blob(reserved, compressed_size);
                }
            }
        }
        self.done = true;
        id
    }

    /// Undo everything but the pins' effect on waiters, which are woken.
    async fn rollback(mut self) {
        let shared = Arc::clone(&self.shared);
        let discard = {
            let mut state = shared.state.lock();
            self.release(&mut state)
        };
        if let Some(discard) = discard {
            shared.discard(discard).await;
        }
    }
}

impl Drop for Ingestion {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let discard = {
            let mut state = shared.state.lock();
            self.release(&mut state)
        };
        if let Some(discard) = discard {
            shared.discard_now(discard);
        }
    }
}
