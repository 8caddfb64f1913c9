//! Analyzer boundary: the pure per-file computation, invoked once per new
//! job. The trait keeps it an opaque collaborator to the rest of the system.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::debug;

use filescan_core::LetterCounts;

use crate::store::CHUNK_SIZE;

/// Analyzer failure.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// The blob is gone; retrying will not bring it back.
    #[error("blob not found: {0}")]
    BlobMissing(String),

    /// Transient read failure; eligible for retry.
    #[error("blob read failed: {0}")]
    Io(#[from] io::Error),
}

impl AnalysisError {
    /// Whether a retry could plausibly succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, AnalysisError::Io(_))
    }
}

/// Pure function over a byte stream: 26 uppercase letters -> counts.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, blob_path: &Path) -> Result<LetterCounts, AnalysisError>;
}

/// The real analyzer: streams the blob in fixed chunks and tallies ASCII
/// letters case-insensitively.
#[derive(Debug, Default)]
pub struct LetterCountAnalyzer;

#[async_trait]
impl Analyzer for LetterCountAnalyzer {
    async fn analyze(&self, blob_path: &Path) -> Result<LetterCounts, AnalysisError> {
        let mut file = match fs::File::open(blob_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(AnalysisError::BlobMissing(blob_path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut counts = LetterCounts::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            counts.tally_chunk(&buf[..n]);
        }
        debug!(path = %blob_path.display(), letters = counts.total(), "blob analyzed");
        Ok(counts)
    }
}
