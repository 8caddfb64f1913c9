//! Postgres-backed job ledger.
//!
//! All state transitions are single conditional `UPDATE ... WHERE status = _`
//! statements, so mutual exclusion between competing processors is enforced
//! by the database row lock, not by application state.
//!
//! ## Error mapping
//!
//! | SQLx error | PostgreSQL code | LedgerError |
//! |------------|-----------------|-------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | zero rows from a conditional update | n/a | `NotFound` / `InvalidTransition` (resolved by re-reading the row) |
//! | anything else | any | `Backend` |

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{info, instrument};
use uuid::Uuid;

use filescan_core::{ContentDigest, Job, JobId, JobStatus, LetterCounts, ReleaseOutcome};

use super::{JobLedger, LedgerError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id UUID PRIMARY KEY,
    file_hash VARCHAR(64) NOT NULL,
    original_filename VARCHAR(255) NOT NULL,
    file_size BIGINT NOT NULL,
    status VARCHAR(20) NOT NULL DEFAULT 'pending',
    results JSONB,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    completed_at TIMESTAMPTZ,
    expires_at TIMESTAMPTZ NOT NULL,
    metadata JSONB
);

CREATE INDEX IF NOT EXISTS idx_jobs_file_hash ON jobs(file_hash);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_expires_at ON jobs(expires_at);
"#;

const JOB_COLUMNS: &str = "job_id, file_hash, original_filename, file_size, status, results, \
     error_message, retry_count, created_at, updated_at, completed_at, expires_at, metadata";

/// Durable ledger on a shared connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobLedger {
    pool: Arc<PgPool>,
}

impl PostgresJobLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect a fresh pool and bootstrap the schema (idempotent).
    pub async fn connect(database_url: &str) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .min_connections(2)
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| LedgerError::Backend(format!("connect failed: {e}")))?;
        let ledger = Self::new(pool);
        ledger.init_schema().await?;
        Ok(ledger)
    }

    /// Create the jobs table and its indexes if missing.
    pub async fn init_schema(&self) -> Result<(), LedgerError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| LedgerError::Backend(format!("schema init failed: {e}")))?;
        info!("job ledger schema initialized");
        Ok(())
    }

    /// Resolve a zero-row conditional update into the precise error.
    async fn transition_conflict(
        &self,
        job_id: JobId,
        to: JobStatus,
    ) -> LedgerError {
        match self.get(job_id).await {
            Ok(Some(job)) => {
                tracing::warn!(%job_id, from = %job.status, %to, "rejected illegal state transition");
                LedgerError::InvalidTransition {
                    job_id,
                    from: job.status,
                    to,
                }
            }
            Ok(None) => LedgerError::NotFound(job_id),
            Err(e) => e,
        }
    }
}

fn map_sqlx_error(operation: &str, job_id: Option<JobId>, e: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some("23505") {
            if let Some(id) = job_id {
                return LedgerError::AlreadyExists(id);
            }
        }
    }
    LedgerError::Backend(format!("{operation}: {e}"))
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, LedgerError> {
    let bad = |what: &str, e: String| LedgerError::Backend(format!("corrupt row: {what}: {e}"));

    let digest_hex: String = row.try_get("file_hash").map_err(|e| bad("file_hash", e.to_string()))?;
    let status_text: String = row.try_get("status").map_err(|e| bad("status", e.to_string()))?;
    let results: Option<serde_json::Value> =
        row.try_get("results").map_err(|e| bad("results", e.to_string()))?;
    let metadata: Option<serde_json::Value> =
        row.try_get("metadata").map_err(|e| bad("metadata", e.to_string()))?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get::<Uuid, _>("job_id").map_err(|e| bad("job_id", e.to_string()))?),
        digest: ContentDigest::from_str(&digest_hex).map_err(|e| bad("file_hash", e.to_string()))?,
        original_filename: row
            .try_get("original_filename")
            .map_err(|e| bad("original_filename", e.to_string()))?,
        file_size: row.try_get::<i64, _>("file_size").map_err(|e| bad("file_size", e.to_string()))?
            as u64,
        status: JobStatus::from_str(&status_text).map_err(|e| bad("status", e.to_string()))?,
        results: results
            .map(|v| serde_json::from_value::<LetterCounts>(v))
            .transpose()
            .map_err(|e| bad("results", e.to_string()))?,
        error_message: row
            .try_get("error_message")
            .map_err(|e| bad("error_message", e.to_string()))?,
        retry_count: row
            .try_get::<i32, _>("retry_count")
            .map_err(|e| bad("retry_count", e.to_string()))? as u32,
        created_at: row.try_get("created_at").map_err(|e| bad("created_at", e.to_string()))?,
        updated_at: row.try_get("updated_at").map_err(|e| bad("updated_at", e.to_string()))?,
        completed_at: row
            .try_get("completed_at")
            .map_err(|e| bad("completed_at", e.to_string()))?,
        expires_at: row.try_get("expires_at").map_err(|e| bad("expires_at", e.to_string()))?,
        metadata: match metadata {
            Some(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        },
    })
}

#[async_trait]
impl JobLedger for PostgresJobLedger {
    #[instrument(skip(self, job), fields(job_id = %job.id, digest = %job.digest), err)]
    async fn insert(&self, job: &Job) -> Result<(), LedgerError> {
        let results = job
            .results
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| LedgerError::Backend(format!("serialize results: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, file_hash, original_filename, file_size, status,
                results, error_message, retry_count,
                created_at, updated_at, completed_at, expires_at, metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.digest.to_hex())
        .bind(&job.original_filename)
        .bind(job.file_size as i64)
        .bind(job.status.as_str())
        .bind(results)
        .bind(&job.error_message)
        .bind(job.retry_count as i32)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.completed_at)
        .bind(job.expires_at)
        .bind(serde_json::Value::Object(job.metadata.clone()))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", Some(job.id), e))?;

        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, LedgerError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", None, e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn latest_completed_for_digest(
        &self,
        digest: &ContentDigest,
    ) -> Result<Option<Job>, LedgerError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE file_hash = $1 AND status = 'completed'
            ORDER BY completed_at DESC
            LIMIT 1
            "#
        ))
        .bind(digest.to_hex())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_completed_for_digest", None, e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn try_claim(&self, job_id: JobId) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'processing', updated_at = NOW()
            WHERE job_id = $1 AND status = 'pending'
            "#,
        )
        .bind(job_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_claim", None, e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        // Distinguish a lost race (no-op) from a dangling job id.
        match self.get(job_id).await? {
            Some(_) => Ok(false),
            None => Err(LedgerError::NotFound(job_id)),
        }
    }

    #[instrument(skip(self, results), err)]
    async fn complete(&self, job_id: JobId, results: &LetterCounts) -> Result<Job, LedgerError> {
        let payload = serde_json::to_value(results)
            .map_err(|e| LedgerError::Backend(format!("serialize results: {e}")))?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'completed', results = $2,
                completed_at = NOW(), updated_at = NOW()
            WHERE job_id = $1 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(payload)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", None, e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.transition_conflict(job_id, JobStatus::Completed).await),
        }
    }

    #[instrument(skip(self), err)]
    async fn fail(&self, job_id: JobId, error_message: &str) -> Result<Job, LedgerError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'failed', error_message = $2,
                completed_at = NOW(), updated_at = NOW()
            WHERE job_id = $1 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(error_message)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", None, e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.transition_conflict(job_id, JobStatus::Failed).await),
        }
    }

    #[instrument(skip(self), err)]
    async fn release_for_retry(
        &self,
        job_id: JobId,
        max_retries: u32,
    ) -> Result<ReleaseOutcome, LedgerError> {
        // One atomic statement covers both outcomes: requeue with an
        // incremented retry count, or terminal failure once the budget is
        // spent.
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = CASE WHEN retry_count >= $2 THEN 'failed' ELSE 'pending' END,
                error_message = CASE WHEN retry_count >= $2
                    THEN 'retries exhausted after ' || retry_count || ' attempts'
                    ELSE error_message END,
                completed_at = CASE WHEN retry_count >= $2 THEN NOW() ELSE completed_at END,
                retry_count = CASE WHEN retry_count >= $2 THEN retry_count ELSE retry_count + 1 END,
                updated_at = NOW()
            WHERE job_id = $1 AND status = 'processing'
            RETURNING status, retry_count
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(max_retries as i32)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_for_retry", None, e))?;

        match row {
            Some(row) => {
                let status: String = row
                    .try_get("status")
                    .map_err(|e| LedgerError::Backend(e.to_string()))?;
                if status == "failed" {
                    Ok(ReleaseOutcome::Exhausted)
                } else {
                    let retry_count: i32 = row
                        .try_get("retry_count")
                        .map_err(|e| LedgerError::Backend(e.to_string()))?;
                    Ok(ReleaseOutcome::Requeued {
                        retry_count: retry_count as u32,
                    })
                }
            }
            None => Err(self.transition_conflict(job_id, JobStatus::Pending).await),
        }
    }

    async fn digest_in_flight(&self, digest: &ContentDigest) -> Result<bool, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM jobs
                WHERE file_hash = $1 AND status IN ('pending', 'processing')
            ) AS in_flight
            "#,
        )
        .bind(digest.to_hex())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("digest_in_flight", None, e))?;

        row.try_get("in_flight")
            .map_err(|e| LedgerError::Backend(e.to_string()))
    }

    async fn stale_digests(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ContentDigest>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT file_hash FROM jobs
            GROUP BY file_hash
            HAVING MAX(created_at) < $1
            "#,
        )
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stale_digests", None, e))?;

        rows.iter()
            .map(|row| {
                let hex: String = row
                    .try_get("file_hash")
                    .map_err(|e| LedgerError::Backend(e.to_string()))?;
                ContentDigest::from_str(&hex)
                    .map_err(|e| LedgerError::Backend(format!("corrupt file_hash: {e}")))
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, LedgerError> {
        let result = sqlx::query("DELETE FROM jobs WHERE expires_at < $1")
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_expired", None, e))?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        sqlx::query("SELECT 1")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ping", None, e))?;
        Ok(())
    }
}
