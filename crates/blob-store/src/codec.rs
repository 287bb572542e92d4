//! Streaming gzip compression of blob files.
//!
//! flate2's writer-side encoder and decoder work on in-memory buffers; the
//! buffers are moved to and from tokio files between chunks so the runtime is
//! never blocked on disk IO.

use std::io::{self, Write};
use std::path::Path;

use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Compressed bytes read from a blob file per step.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Decompressed bytes kept consumed at the head of the buffer before it is
/// compacted.
const COMPACT_THRESHOLD: usize = 256 * 1024;

/// Compresses a stream of chunks into a new blob file.
pub(crate) struct CompressWriter {
    file: File,
    encoder: GzEncoder<Vec<u8>>,
    written: u64,
}

impl CompressWriter {
    /// Create the blob file at `path` (and its parent directories).
    pub async fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(path).await?;
        Ok(Self {
            file,
            encoder: GzEncoder::new(Vec::new(), Compression::default()),
            written: 0,
        })
    }

    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.encoder.write_all(chunk)?;
        self.drain().await
    }

    async fn drain(&mut self) -> io::Result<()> {
        let buffer = self.encoder.get_mut();
        if !buffer.is_empty() {
            self.file.write_all(buffer).await?;
            self.written += buffer.len() as u64;
            buffer.clear();
        }
        Ok(())
    }

    /// Flush the compressed stream to disk and return the file's size.
    pub async fn finish(mut self) -> io::Result<u64> {
        self.encoder.try_finish()?;
        self.drain().await?;
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(self.written)
    }
}

/// Outcome of comparing part of a blob's content with expected bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Comparison {
    Same,
    Differs,
    /// The content ended before the expected bytes did (and matched so far)
    Short,
}

/// Incrementally decompresses a blob file.
pub(crate) struct InflateReader {
    file: File,
    decoder: GzDecoder<Vec<u8>>,
    consumed: usize,
    eof: bool,
    chunk: Vec<u8>,
}

impl InflateReader {
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path).await?;
        Ok(Self {
            file,
            decoder: GzDecoder::new(Vec::new()),
            consumed: 0,
            eof: false,
            chunk: vec![0; READ_CHUNK_SIZE],
        })
    }

    /// Decompress until at least `want` bytes are buffered or the content
    /// ends, and return the buffered bytes.
    async fn fill(&mut self, want: usize) -> io::Result<&[u8]> {
        while !self.eof && self.decoder.get_ref().len() - self.consumed < want {
            let read = self.file.read(&mut self.chunk).await?;
            if read == 0 {
                self.decoder.try_finish()?;
                self.eof = true;
            } else {
                self.decoder.write_all(&self.chunk[..read])?;
            }
        }
        Ok(&self.decoder.get_ref()[self.consumed..])
    }

    fn consume(&mut self, count: usize) {
        self.consumed += count;
        let buffer = self.decoder.get_mut();
        if self.consumed == buffer.len() {
            buffer.clear();
            self.consumed = 0;
        } else if self.consumed >= COMPACT_THRESHOLD {
            buffer.drain(..self.consumed);
            self.consumed = 0;
        }
    }

    /// Compare the next `expected.len()` bytes of content with `expected`,
    /// consuming them.
    pub async fn compare(&mut self, expected: &[u8]) -> io::Result<Comparison> {
        let available = self.fill(expected.len()).await?;
        let count = available.len().min(expected.len());
        let outcome = if available[..count] != expected[..count] {
            Comparison::Differs
        } else if count < expected.len() {
            Comparison::Short
        } else {
            Comparison::Same
        };
        self.consume(count);
        Ok(outcome)
    }

    /// Has all the content been consumed?
    pub async fn at_end(&mut self) -> io::Result<bool> {
        Ok(self.fill(1).await?.is_empty())
    }

    pub async fn read_to_end(mut self) -> io::Result<Vec<u8>> {
        let mut content = Vec::new();
        loop {
            let available = self.fill(READ_CHUNK_SIZE).await?;
            if available.is_empty() {
                return Ok(content);
            }
            let count = available.len();
            content.extend_from_slice(available);
            self.consume(count);
        }
    }

    /// Decompressed length of the content, without keeping it around.
    pub async fn count_to_end(mut self) -> io::Result<u64> {
        let mut total = 0u64;
        loop {
            let count = self.fill(READ_CHUNK_SIZE).await?.len();
            if count == 0 {
                return Ok(total);
            }
            total += count as u64;
            self.consume(count);
        }
    }
}
