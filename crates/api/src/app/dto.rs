//! Response DTOs and JSON mapping.

use chrono::{DateTime, Utc};
use serde::Serialize;

use filescan_core::{JobId, JobSnapshot, JobStatus, LetterCounts};
use filescan_infra::retention::StorageTier;

#[derive(Debug, Serialize)]
pub struct FileUploadResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub message: String,
    pub deduplication: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<LetterCounts>,
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub original_filename: String,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<LetterCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<JobSnapshot> for JobStatusResponse {
    fn from(snapshot: JobSnapshot) -> Self {
        Self {
            job_id: snapshot.job_id,
            status: snapshot.status,
            original_filename: snapshot.original_filename,
            file_size: snapshot.file_size,
            results: snapshot.results,
            error_message: snapshot.error_message,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            completed_at: snapshot.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StorageHealth {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub percent_used: f64,
    pub tier: StorageTier,
}

#[derive(Debug, Serialize)]
pub struct QueueHealth {
    pub status: &'static str,
    pub stream_length: u64,
    pub pending_count: u64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
    pub redis: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageHealth>,
    pub queue: QueueHealth,
}
