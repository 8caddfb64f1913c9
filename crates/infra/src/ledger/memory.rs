//! In-memory ledger for dev/test.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use filescan_core::{ContentDigest, Job, JobId, JobStatus, LetterCounts, ReleaseOutcome};

use super::{JobLedger, LedgerError};

/// HashMap-backed ledger with the same conditional-update semantics as the
/// Postgres implementation.
#[derive(Debug, Default)]
pub struct InMemoryJobLedger {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_job<T>(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut Job) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(LedgerError::NotFound(job_id))?;
        f(job)
    }
}

fn invalid(job_id: JobId, from: JobStatus, to: JobStatus) -> LedgerError {
    tracing::warn!(%job_id, %from, %to, "rejected illegal state transition");
    LedgerError::InvalidTransition { job_id, from, to }
}

#[async_trait]
impl JobLedger for InMemoryJobLedger {
    async fn insert(&self, job: &Job) -> Result<(), LedgerError> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(LedgerError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, LedgerError> {
        Ok(self.jobs.read().unwrap().get(&job_id).cloned())
    }

    async fn latest_completed_for_digest(
        &self,
        digest: &ContentDigest,
    ) -> Result<Option<Job>, LedgerError> {
        let jobs = self.jobs.read().unwrap();
        Ok(jobs
            .values()
            .filter(|j| j.digest == *digest && j.status == JobStatus::Completed)
            .max_by_key(|j| j.completed_at)
            .cloned())
    }

    async fn try_claim(&self, job_id: JobId) -> Result<bool, LedgerError> {
        let mut jobs = self.jobs.write().unwrap();
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.start_processing()
                    .map_err(|_| invalid(job_id, job.status, JobStatus::Processing))?;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(LedgerError::NotFound(job_id)),
        }
    }

    async fn complete(&self, job_id: JobId, results: &LetterCounts) -> Result<Job, LedgerError> {
        self.with_job(job_id, |job| {
            job.complete(*results)
                .map_err(|_| invalid(job_id, job.status, JobStatus::Completed))?;
            Ok(job.clone())
        })
    }

    async fn fail(&self, job_id: JobId, error_message: &str) -> Result<Job, LedgerError> {
        self.with_job(job_id, |job| {
            job.fail(error_message)
                .map_err(|_| invalid(job_id, job.status, JobStatus::Failed))?;
            Ok(job.clone())
        })
    }

    async fn release_for_retry(
        &self,
        job_id: JobId,
        max_retries: u32,
    ) -> Result<ReleaseOutcome, LedgerError> {
        self.with_job(job_id, |job| {
            job.release_for_retry(max_retries)
                .map_err(|_| invalid(job_id, job.status, JobStatus::Pending))
        })
    }

    async fn digest_in_flight(&self, digest: &ContentDigest) -> Result<bool, LedgerError> {
        let jobs = self.jobs.read().unwrap();
        Ok(jobs
            .values()
            .any(|j| j.digest == *digest && !j.status.is_terminal()))
    }

    async fn stale_digests(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ContentDigest>, LedgerError> {
        let jobs = self.jobs.read().unwrap();
        let mut newest: HashMap<ContentDigest, DateTime<Utc>> = HashMap::new();
        for job in jobs.values() {
            let entry = newest.entry(job.digest).or_insert(job.created_at);
            if job.created_at > *entry {
                *entry = job.created_at;
            }
        }
        Ok(newest
            .into_iter()
            .filter(|(_, latest)| *latest < cutoff)
            .map(|(digest, _)| digest)
            .collect())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, LedgerError> {
        let mut jobs = self.jobs.write().unwrap();
        let before = jobs.len();
        jobs.retain(|_, job| job.expires_at >= now);
        Ok((before - jobs.len()) as u64)
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}
