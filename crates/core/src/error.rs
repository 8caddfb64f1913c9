//! Domain error model.

use thiserror::Error;

use crate::id::JobId;
use crate::job::JobStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error taxonomy.
///
/// Ingestion-time errors (`PayloadTooLarge`, `StorageExhausted`) surface
/// synchronously before any job exists. Processing-time errors are retried
/// and only ever reach callers as a terminal `failed` job state.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    /// Upload exceeded the configured maximum size; rejected mid-stream.
    #[error("payload exceeds maximum of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    /// Storage is in the emergency tier; uploads are rejected until
    /// utilization drops.
    #[error("storage exhausted: {percent_used:.1}% used, uploads disabled")]
    StorageExhausted { percent_used: f64 },

    /// The analyzer failed; recoverable by retry up to the bound.
    #[error("analysis failed: {0}")]
    Analysis(String),

    /// Retry budget exhausted; the job is terminally failed.
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// An illegal state-machine transition was attempted. Always a
    /// programming error or a lost race; rejected, never silently applied.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// Unknown job identifier on a status query.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// An identifier or digest failed to parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn analysis(msg: impl Into<String>) -> Self {
        Self::Analysis(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(from: JobStatus, to: JobStatus) -> Self {
        Self::InvalidTransition { from, to }
    }
}
