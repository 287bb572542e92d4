//! Declared content checksum used to find deduplication candidates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// 128-bit checksum declared by the caller of `add_blob`.
///
/// The engine never computes nor trusts it: two different byte sequences may
/// carry the same digest and are stored as distinct blobs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(#[serde(with = "hex::serde")] [u8; 16]);

#[derive(Debug, thiserror::Error)]
#[error("invalid digest: {0}")]
pub struct DigestParseError(String);

impl Digest {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Build a digest from the first 16 bytes of a longer hash.
    pub fn from_prefix(hash: &[u8]) -> Result<Self, DigestParseError> {
        let prefix: [u8; 16] = hash
            .get(..16)
            .and_then(|p| p.try_into().ok())
            .ok_or_else(|| DigestParseError(format!("{} bytes is too short", hash.len())))?;
        Ok(Self(prefix))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

impl FromStr for Digest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| DigestParseError(e.to_string()))?;
        Ok(Self(bytes))
    }
}

/// Computes digests of content, fed chunk by chunk.
///
/// Only used when the manager is asked to verify declared digests.
pub trait DigestAlgorithm: fmt::Debug + Send + Sync {
    fn start(&self) -> Box<dyn DigestState>;
}

/// Digest computation in progress.
pub trait DigestState: Send {
    fn update(&mut self, chunk: &[u8]);
    fn finish(self: Box<Self>) -> Digest;
}

/// First 16 bytes of the SHA-256 of the content.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Prefix;

impl DigestAlgorithm for Sha256Prefix {
    fn start(&self) -> Box<dyn DigestState> {
        Box::new(Sha256Prefixing(Sha256::default()))
    }
}

struct Sha256Prefixing(Sha256);

impl DigestState for Sha256Prefixing {
    fn update(&mut self, chunk: &[u8]) {
        sha2::Digest::update(&mut self.0, chunk);
    }

    fn finish(self: Box<Self>) -> Digest {
        let hash = sha2::Digest::finalize(self.0);
        let mut prefix = [0u8; 16];
        prefix.copy_from_slice(&hash[..16]);
        Digest(prefix)
    }
}
