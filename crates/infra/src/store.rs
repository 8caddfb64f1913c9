//! Content-addressed blob storage on the local filesystem.
//!
//! Layout:
//! ```text
//! {root}/
//! ├── ab/
//! │   └── cd/
//! │       └── abcd1234...   # blob, named by its full SHA-256 hex digest
//! └── tmp_0192f3...         # in-flight upload, renamed into place on success
//! ```
//!
//! The store is write-once-per-digest: a second write for an existing digest
//! is a no-op. Ingestion streams in fixed-size chunks, computing the digest
//! incrementally in the same pass, so peak memory is O(chunk size).

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use filescan_core::{ContentDigest, DigestHasher};

/// Chunk size for streaming reads and writes (1 MiB).
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stream exceeded the configured maximum; enforced incrementally,
    /// before the write completes.
    #[error("payload exceeds maximum of {limit} bytes")]
    TooLarge { limit: u64 },

    /// The temp file re-hashed to a different digest than the stream
    /// (corruption between write and rename).
    #[error("blob {expected} failed verification: stored bytes hash to {actual}")]
    Corrupt {
        expected: ContentDigest,
        actual: ContentDigest,
    },

    #[error("storage i/o error: {0}")]
    Io(#[from] io::Error),
}

/// A successfully persisted blob.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub digest: ContentDigest,
    pub size: u64,
    pub path: PathBuf,
}

/// Point-in-time view of the volume holding the store.
#[derive(Debug, Clone, Copy)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl DiskUsage {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.available_bytes)
    }

    pub fn percent_used(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes() as f64 / self.total_bytes as f64) * 100.0
    }
}

/// Disk utilization query, consulted fresh at every decision point rather
/// than cached, so upload admission and retention sweeps never act on stale
/// shared state. Test impls return fixed values.
pub trait UsageProbe: Send + Sync {
    fn usage(&self) -> Result<DiskUsage, StoreError>;
}

/// Filesystem content store.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "content store opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic blob location: `{root}/{hex[0..2]}/{hex[2..4]}/{hex}`.
    pub fn blob_path(&self, digest: &ContentDigest) -> PathBuf {
        let hex = digest.to_hex();
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(&hex)
    }

    /// Stream `reader` into the store, computing the digest in the same pass.
    ///
    /// Bytes land in a uniquely-named temp file first; on success the temp
    /// file is verified by re-hash and atomically renamed into its
    /// content-addressed location. On any failure (including the size cap)
    /// the partial temp file is discarded and nothing else changes.
    pub async fn ingest<R: AsyncRead + Unpin>(
        &self,
        reader: R,
        max_bytes: u64,
    ) -> Result<StoredBlob, StoreError> {
        let temp_path = self.root.join(format!("tmp_{}", Uuid::now_v7().simple()));
        match self.ingest_via_temp(reader, &temp_path, max_bytes).await {
            Ok(blob) => Ok(blob),
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&temp_path).await {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!(path = %temp_path.display(), error = %cleanup, "failed to remove temp file");
                    }
                }
                Err(e)
            }
        }
    }

    async fn ingest_via_temp<R: AsyncRead + Unpin>(
        &self,
        mut reader: R,
        temp_path: &Path,
        max_bytes: u64,
    ) -> Result<StoredBlob, StoreError> {
        let mut file = fs::File::create(temp_path).await?;
        let mut hasher = DigestHasher::new();
        let mut buf = vec![0u8; CHUNK_SIZE];

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            if hasher.len() > max_bytes {
                return Err(StoreError::TooLarge { limit: max_bytes });
            }
            file.write_all(&buf[..n]).await?;
        }
        file.flush().await?;
        drop(file);

        let (digest, size) = hasher.finalize();
        let final_path = self.blob_path(&digest);

        if fs::try_exists(&final_path).await? {
            // Write-once-per-digest: the bytes are already here.
            fs::remove_file(temp_path).await?;
            debug!(%digest, "blob already stored, ingest is a no-op");
            return Ok(StoredBlob {
                digest,
                size,
                path: final_path,
            });
        }

        self.verify(temp_path, &digest).await?;

        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(temp_path, &final_path).await?;
        info!(%digest, size, "blob stored");

        Ok(StoredBlob {
            digest,
            size,
            path: final_path,
        })
    }

    /// Re-hash a just-written file and compare against the stream digest.
    async fn verify(&self, path: &Path, expected: &ContentDigest) -> Result<(), StoreError> {
        let mut file = fs::File::open(path).await?;
        let mut hasher = DigestHasher::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let (actual, _) = hasher.finalize();
        if actual != *expected {
            warn!(expected = %expected, actual = %actual, "blob corruption detected during ingest");
            return Err(StoreError::Corrupt {
                expected: *expected,
                actual,
            });
        }
        Ok(())
    }

    pub async fn contains(&self, digest: &ContentDigest) -> Result<bool, StoreError> {
        Ok(fs::try_exists(self.blob_path(digest)).await?)
    }

    /// Delete a blob. Returns `false` if it was not present. Empty shard
    /// directories are removed opportunistically.
    pub async fn delete(&self, digest: &ContentDigest) -> Result<bool, StoreError> {
        let path = self.blob_path(digest);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        info!(%digest, "blob deleted");

        // Shard dirs are shared; removal only succeeds once they are empty.
        if let Some(shard) = path.parent() {
            let _ = fs::remove_dir(shard).await;
            if let Some(prefix) = shard.parent() {
                let _ = fs::remove_dir(prefix).await;
            }
        }
        Ok(true)
    }

    /// Remove `tmp_*` leftovers older than `max_age` (crashed or killed
    /// uploads). Returns how many were removed; per-file failures are logged
    /// and skipped.
    pub async fn sweep_temp(&self, max_age: Duration) -> Result<u64, StoreError> {
        let mut removed = 0u64;
        let now = SystemTime::now();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with("tmp_") {
                continue;
            }
            let age = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => now.duration_since(modified).unwrap_or_default(),
                Err(e) => {
                    warn!(file = name, error = %e, "could not stat temp file");
                    continue;
                }
            };
            if age < max_age {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    info!(file = name, age_secs = age.as_secs(), "removed orphaned temp file");
                    removed += 1;
                }
                Err(e) => warn!(file = name, error = %e, "failed to remove temp file"),
            }
        }
        Ok(removed)
    }
}

impl UsageProbe for ContentStore {
    fn usage(&self) -> Result<DiskUsage, StoreError> {
        let total_bytes = fs2::total_space(&self.root)?;
        let available_bytes = fs2::available_space(&self.root)?;
        Ok(DiskUsage {
            total_bytes,
            available_bytes,
        })
    }
}
