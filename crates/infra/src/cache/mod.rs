//! Result Cache: advisory, TTL-bounded copies of job snapshots and
//! digest-keyed results.
//!
//! Two disjoint key spaces with independently configured TTLs:
//!
//! - `job:{job_id}:status` holds status snapshots (short TTL)
//! - `file:{digest}:results` holds digest -> result entries (long TTL)
//!
//! Absence never means "does not exist", only "consult the ledger". Callers
//! treat write failures as advisory (log and continue); the ledger remains
//! authoritative.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use filescan_core::{ContentDigest, JobId, JobSnapshot, LetterCounts};

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::InMemoryResultCache;
#[cfg(feature = "redis")]
pub use redis::RedisResultCache;

/// Cache error.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache connection error: {0}")]
    Connection(String),

    #[error("cache command error: {0}")]
    Command(String),

    #[error("cache serialization error: {0}")]
    Serialization(String),
}

/// A cached digest -> result entry.
///
/// Carries the originating job id so a dedup hit can hand the caller a
/// pollable identifier without creating a new ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub digest: ContentDigest,
    pub job_id: JobId,
    pub results: LetterCounts,
    pub file_size: u64,
}

pub(crate) fn job_key(job_id: JobId) -> String {
    format!("job:{job_id}:status")
}

pub(crate) fn result_key(digest: &ContentDigest) -> String {
    format!("file:{digest}:results")
}

/// Port over the ephemeral key-value cache.
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Store a job-status snapshot (short TTL key space).
    async fn put_job_snapshot(&self, snapshot: &JobSnapshot) -> Result<(), CacheError>;

    /// Fetch a job-status snapshot; `None` on miss or expiry, never an error.
    async fn job_snapshot(&self, job_id: JobId) -> Result<Option<JobSnapshot>, CacheError>;

    /// Drop a job-status entry so the next poll reads through to the ledger.
    async fn invalidate_job(&self, job_id: JobId) -> Result<(), CacheError>;

    /// Store a digest -> result entry (long TTL key space).
    async fn put_result(&self, entry: &CachedResult) -> Result<(), CacheError>;

    /// Fetch a digest -> result entry.
    async fn result_for_digest(
        &self,
        digest: &ContentDigest,
    ) -> Result<Option<CachedResult>, CacheError>;

    /// Liveness check for health reporting.
    async fn ping(&self) -> Result<(), CacheError>;
}
