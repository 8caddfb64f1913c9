//! Job Ledger: the durable, authoritative record of every unit of work.
//!
//! The cache holds read-through copies with TTLs; when those expire the
//! ledger is the source of truth. All state transitions go through atomic
//! conditional updates so racing processors cannot both win a claim.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use filescan_core::{ContentDigest, Job, JobId, JobStatus, LetterCounts, ReleaseOutcome};

mod memory;
mod postgres;

pub use memory::InMemoryJobLedger;
pub use postgres::PostgresJobLedger;

/// Ledger error.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    /// An out-of-order transition was attempted; rejected, never applied.
    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("ledger backend error: {0}")]
    Backend(String),
}

/// Port over the durable job record.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Insert a new job row; exactly one row per job id.
    async fn insert(&self, job: &Job) -> Result<(), LedgerError>;

    /// Point lookup by id.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, LedgerError>;

    /// Dedup lookup: the most recently completed job for this digest, if any.
    async fn latest_completed_for_digest(
        &self,
        digest: &ContentDigest,
    ) -> Result<Option<Job>, LedgerError>;

    /// Atomically transition `pending -> processing`.
    ///
    /// This is the mutual-exclusion point for competing processors: exactly
    /// one caller observes `true`; a racing loser observes `false` (a no-op,
    /// not an error).
    async fn try_claim(&self, job_id: JobId) -> Result<bool, LedgerError>;

    /// `processing -> completed`, persisting the result atomically with the
    /// transition. Returns the updated job.
    async fn complete(&self, job_id: JobId, results: &LetterCounts) -> Result<Job, LedgerError>;

    /// `processing -> failed`, persisting the error detail atomically with
    /// the transition. Returns the updated job.
    async fn fail(&self, job_id: JobId, error_message: &str) -> Result<Job, LedgerError>;

    /// `processing -> pending` with retry accounting: increments the retry
    /// count, or transitions to `failed`/retries-exhausted once the bound is
    /// spent. Single atomic update.
    async fn release_for_retry(
        &self,
        job_id: JobId,
        max_retries: u32,
    ) -> Result<ReleaseOutcome, LedgerError>;

    /// Whether any job in `pending` or `processing` references this digest.
    /// Blobs with in-flight references must survive retention sweeps.
    async fn digest_in_flight(&self, digest: &ContentDigest) -> Result<bool, LedgerError>;

    /// Digests whose most recent referencing job was created before `cutoff`
    /// (re-uploading content refreshes its lease).
    async fn stale_digests(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ContentDigest>, LedgerError>;

    /// Mass-expire rows whose `expires_at` has passed. Returns the count.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, LedgerError>;

    /// Liveness check for health reporting.
    async fn ping(&self) -> Result<(), LedgerError>;
}
