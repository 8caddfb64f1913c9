//! The job entity and its state machine.
//!
//! `pending -> processing -> {completed, failed}`, with the redelivery arc
//! `processing -> pending` for crash recovery. `pending` is the sole initial
//! state; `completed` and `failed` are terminal. Anything else is rejected
//! with [`DomainError::InvalidTransition`], never silently applied.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::counts::LetterCounts;
use crate::digest::ContentDigest;
use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed by a processor.
    Pending,
    /// Claimed by exactly one processor.
    Processing,
    /// Analyzer result persisted; terminal.
    Completed,
    /// Unrecoverable error or retry budget exhausted; terminal.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Pending)
        )
    }

    /// Stable text form, also used as the ledger column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::invalid_id(format!("job status: {other:?}"))),
        }
    }
}

/// Outcome of releasing a `processing` job back for another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Returned to `pending`; retry count after the increment.
    Requeued { retry_count: u32 },
    /// Budget spent; the job went `failed` with a retries-exhausted detail.
    Exhausted,
}

/// A unit of scan work, owned exclusively by the Job Ledger.
///
/// The digest is deliberately not unique across jobs: duplicate uploads that
/// race before one completes each get their own row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub digest: ContentDigest,
    pub original_filename: String,
    pub file_size: u64,
    pub status: JobStatus,
    /// Present only in `completed`.
    pub results: Option<LetterCounts>,
    /// Present only in `failed`; human-readable, never a stack trace.
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    /// Open, schema-less bag for forward compatibility.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Job {
    /// Create a new job in `pending`, expiring after `retention`.
    pub fn new(
        digest: ContentDigest,
        original_filename: impl Into<String>,
        file_size: u64,
        retention: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            digest,
            original_filename: original_filename.into(),
            file_size,
            status: JobStatus::Pending,
            results: None,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            expires_at: now + retention,
            metadata: serde_json::Map::new(),
        }
    }

    fn transition(&mut self, next: JobStatus) -> DomainResult<()> {
        if !self.status.can_transition(next) {
            return Err(DomainError::invalid_transition(self.status, next));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// `pending -> processing`: a processor claimed the job.
    pub fn start_processing(&mut self) -> DomainResult<()> {
        self.transition(JobStatus::Processing)
    }

    /// `processing -> completed`: persist the result with the transition.
    pub fn complete(&mut self, results: LetterCounts) -> DomainResult<()> {
        self.transition(JobStatus::Completed)?;
        self.results = Some(results);
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// `processing -> failed`: persist the error detail with the transition.
    pub fn fail(&mut self, error: impl Into<String>) -> DomainResult<()> {
        self.transition(JobStatus::Failed)?;
        self.error_message = Some(error.into());
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// `processing -> pending` after a crash or missed acknowledgment.
    ///
    /// Each release increments the retry count; once another attempt would
    /// exceed `max_retries` the job goes `failed` instead, exactly at the
    /// bound, never before.
    pub fn release_for_retry(&mut self, max_retries: u32) -> DomainResult<ReleaseOutcome> {
        if self.status != JobStatus::Processing {
            return Err(DomainError::invalid_transition(self.status, JobStatus::Pending));
        }
        if self.retry_count >= max_retries {
            let attempts = self.retry_count;
            self.fail(DomainError::RetriesExhausted { attempts }.to_string())?;
            return Ok(ReleaseOutcome::Exhausted);
        }
        self.retry_count += 1;
        self.transition(JobStatus::Pending)?;
        Ok(ReleaseOutcome::Requeued {
            retry_count: self.retry_count,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Read-through view of a job: what status polls return and what the cache
/// holds under the job-status key space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    pub original_filename: String,
    pub file_size: u64,
    pub results: Option<LetterCounts>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            original_filename: job.original_filename.clone(),
            file_size: job.file_size,
            results: job.results,
            error_message: job.error_message.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_job() -> Job {
        Job::new(
            ContentDigest::of(b"job state machine"),
            "sample.txt",
            17,
            Duration::days(7),
        )
    }

    #[test]
    fn happy_path_lifecycle() {
        let mut job = test_job();
        assert_eq!(job.status, JobStatus::Pending);

        job.start_processing().unwrap();
        assert_eq!(job.status, JobStatus::Processing);

        let mut counts = LetterCounts::new();
        counts.tally_chunk(b"abc");
        job.complete(counts).unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert_eq!(job.results.unwrap().get('A'), 1);
    }

    #[test]
    fn failure_records_detail() {
        let mut job = test_job();
        job.start_processing().unwrap();
        job.fail("blob went missing").unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("blob went missing"));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut job = test_job();

        // pending -> completed is not a thing.
        let err = job.complete(LetterCounts::new()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
        assert_eq!(job.status, JobStatus::Pending);

        job.start_processing().unwrap();
        job.complete(LetterCounts::new()).unwrap();

        // Terminal states accept nothing.
        assert!(job.start_processing().is_err());
        assert!(job.fail("late").is_err());
        assert!(job.release_for_retry(3).is_err());
    }

    #[test]
    fn retry_count_strictly_increases_until_the_bound() {
        let mut job = test_job();
        let max = 3;

        for expected in 1..=max {
            job.start_processing().unwrap();
            let outcome = job.release_for_retry(max).unwrap();
            assert_eq!(outcome, ReleaseOutcome::Requeued { retry_count: expected });
            assert_eq!(job.retry_count, expected);
            assert_eq!(job.status, JobStatus::Pending);
        }

        // The attempt beyond the bound fails the job, exactly then.
        job.start_processing().unwrap();
        let outcome = job.release_for_retry(max).unwrap();
        assert_eq!(outcome, ReleaseOutcome::Exhausted);
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("exhausted"));
    }

    #[test]
    fn snapshot_reflects_job() {
        let mut job = test_job();
        job.start_processing().unwrap();
        let snap = JobSnapshot::from(&job);
        assert_eq!(snap.job_id, job.id);
        assert_eq!(snap.status, JobStatus::Processing);
        assert_eq!(snap.file_size, 17);
    }

    #[test]
    fn status_text_round_trips() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<JobStatus>().is_err());
    }
}
