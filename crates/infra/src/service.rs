//! The two core operations composed from the subsystems:
//! `submit(byte stream, declared name)` and `status(job id)`.
//!
//! Submission is fully synchronous with respect to its own writes (blob,
//! ledger row, enqueue) and never waits on the job processors; status reads
//! are non-blocking point lookups (cache, falling back to the ledger).

use std::sync::Arc;

use chrono::Duration;
use tokio::io::AsyncRead;
use tracing::{info, instrument, warn};

use filescan_core::{DomainError, Job, JobId, JobSnapshot, JobStatus, LetterCounts};

use crate::cache::ResultCache;
use crate::dedup::{DedupResolver, Resolution};
use crate::ledger::{JobLedger, LedgerError};
use crate::queue::{QueueError, ScanMessage, WorkQueue};
use crate::retention::StorageTier;
use crate::store::{ContentStore, StoreError, UsageProbe};

/// Submission-path policy.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub max_upload_bytes: u64,
    /// How long ledger rows live before the retention sweep expires them.
    pub job_retention: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 100 * 1024 * 1024,
            job_retention: Duration::days(7),
        }
    }
}

/// Service error: the caller-facing taxonomy plus infrastructure failures.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ScanError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::TooLarge { limit } => {
                ScanError::Domain(DomainError::PayloadTooLarge { limit })
            }
            other => ScanError::Store(other),
        }
    }
}

/// What `submit` hands back to the HTTP layer.
#[derive(Debug, Clone)]
pub struct Submission {
    pub job_id: JobId,
    pub status: JobStatus,
    /// True when the digest resolved via cache or ledger hit.
    pub dedup: bool,
    /// Present immediately on a dedup hit.
    pub results: Option<LetterCounts>,
}

/// The ingestion/polling facade over store, resolver, ledger, cache, queue.
pub struct Scanner {
    store: Arc<ContentStore>,
    usage: Arc<dyn UsageProbe>,
    ledger: Arc<dyn JobLedger>,
    cache: Arc<dyn ResultCache>,
    queue: Arc<dyn WorkQueue>,
    resolver: DedupResolver,
    config: ScannerConfig,
}

impl Scanner {
    pub fn new(
        store: Arc<ContentStore>,
        usage: Arc<dyn UsageProbe>,
        ledger: Arc<dyn JobLedger>,
        cache: Arc<dyn ResultCache>,
        queue: Arc<dyn WorkQueue>,
        config: ScannerConfig,
    ) -> Self {
        let resolver = DedupResolver::new(cache.clone(), ledger.clone());
        Self {
            store,
            usage,
            ledger,
            cache,
            queue,
            resolver,
            config,
        }
    }

    /// Ingest a byte stream: digest + persist in one pass, resolve dedup,
    /// create/enqueue a job on a miss.
    ///
    /// All errors here surface synchronously, before any job exists.
    #[instrument(skip(self, stream), fields(filename = %declared_name), err)]
    pub async fn submit<R: AsyncRead + Unpin>(
        &self,
        stream: R,
        declared_name: &str,
    ) -> Result<Submission, ScanError> {
        // Admission control: a fresh utilization reading, not cached state.
        match self.usage.usage() {
            Ok(usage) => {
                let percent_used = usage.percent_used();
                if StorageTier::for_percent_used(percent_used).rejects_uploads() {
                    return Err(DomainError::StorageExhausted { percent_used }.into());
                }
            }
            // Fail open: an unreadable probe should not take uploads down.
            Err(e) => warn!(error = %e, "usage probe failed, accepting upload"),
        }

        let blob = self
            .store
            .ingest(stream, self.config.max_upload_bytes)
            .await?;

        match self.resolver.resolve(&blob.digest).await? {
            Resolution::CacheHit(hit) | Resolution::LedgerHit(hit) => {
                info!(digest = %blob.digest, job_id = %hit.job_id, "dedup hit, no new job");
                Ok(Submission {
                    job_id: hit.job_id,
                    status: JobStatus::Completed,
                    dedup: true,
                    results: Some(hit.results),
                })
            }
            Resolution::Miss => {
                let job = Job::new(
                    blob.digest,
                    declared_name,
                    blob.size,
                    self.config.job_retention,
                );
                self.ledger.insert(&job).await?;

                if let Err(e) = self.cache.put_job_snapshot(&JobSnapshot::from(&job)).await {
                    warn!(job_id = %job.id, error = %e, "failed to cache initial snapshot");
                }

                self.queue
                    .enqueue(&ScanMessage {
                        job_id: job.id,
                        digest: blob.digest,
                        blob_path: blob.path.display().to_string(),
                        file_size: blob.size,
                    })
                    .await?;

                info!(job_id = %job.id, digest = %blob.digest, size = blob.size, "job created");
                Ok(Submission {
                    job_id: job.id,
                    status: JobStatus::Pending,
                    dedup: false,
                    results: None,
                })
            }
        }
    }

    /// Non-blocking snapshot: cache first, ledger as the source of truth.
    pub async fn status(&self, job_id: JobId) -> Result<JobSnapshot, ScanError> {
        match self.cache.job_snapshot(job_id).await {
            Ok(Some(snapshot)) => return Ok(snapshot),
            Ok(None) => {}
            Err(e) => warn!(%job_id, error = %e, "job cache read failed, consulting ledger"),
        }

        let Some(job) = self.ledger.get(job_id).await? else {
            return Err(DomainError::NotFound(job_id).into());
        };
        let snapshot = JobSnapshot::from(&job);
        if let Err(e) = self.cache.put_job_snapshot(&snapshot).await {
            warn!(%job_id, error = %e, "failed to repopulate job cache");
        }
        Ok(snapshot)
    }
}
