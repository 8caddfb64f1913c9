//! Content digest: the SHA-256 fingerprint used as the content address.
//!
//! Two byte streams with the same digest are treated as the same content
//! everywhere in the system: the blob store path, the dedup lookup, and the
//! result cache key are all derived from it.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::DomainError;

/// Length of the hex form (32 bytes, lowercase hex).
pub const DIGEST_HEX_LEN: usize = 64;

/// SHA-256 digest of a file's bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    /// Digest a complete in-memory byte slice.
    ///
    /// Ingestion uses [`DigestHasher`] to avoid buffering whole files; this
    /// is for small payloads and tests.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// Lowercase hex form, the canonical storage/wire representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self.to_hex())
    }
}

impl FromStr for ContentDigest {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DIGEST_HEX_LEN {
            return Err(DomainError::invalid_id(format!(
                "digest must be {DIGEST_HEX_LEN} hex chars, got {}",
                s.len()
            )));
        }
        let raw = hex::decode(s)
            .map_err(|e| DomainError::invalid_id(format!("digest: {e}")))?;
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentDigest> for String {
    fn from(value: ContentDigest) -> Self {
        value.to_hex()
    }
}

/// Incremental digest computation for single-pass streaming ingestion.
///
/// Feed chunks as they arrive; peak memory stays O(chunk size). Also tracks
/// the byte count so ingestion gets digest and size from one pass.
pub struct DigestHasher {
    inner: Sha256,
    len: u64,
}

impl DigestHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
            len: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Bytes consumed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(self) -> (ContentDigest, u64) {
        (ContentDigest(self.inner.finalize().into()), self.len)
    }
}

impl Default for DigestHasher {
    fn default() -> Self {
        Self::new()
    }
}
