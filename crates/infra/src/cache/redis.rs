//! Redis-backed cache (SETEX/GET/DEL over a managed async connection).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::debug;

use filescan_core::{ContentDigest, JobId, JobSnapshot};

use super::{job_key, result_key, CacheError, CachedResult, ResultCache};

/// Cache on a shared Redis connection.
///
/// `ConnectionManager` reconnects under the hood, so clones are cheap and a
/// single instance serves the whole process.
#[derive(Clone)]
pub struct RedisResultCache {
    conn: ConnectionManager,
    job_ttl: Duration,
    result_ttl: Duration,
}

impl RedisResultCache {
    pub async fn connect(
        redis_url: &str,
        job_ttl: Duration,
        result_ttl: Duration,
    ) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        Ok(Self {
            conn,
            job_ttl,
            result_ttl,
        })
    }

    async fn set_with_ttl(&self, key: &str, payload: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheError::Command(format!("SETEX {key}: {e}")))
    }

    async fn get_raw(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Command(format!("GET {key}: {e}")))
    }
}

#[async_trait]
impl ResultCache for RedisResultCache {
    async fn put_job_snapshot(&self, snapshot: &JobSnapshot) -> Result<(), CacheError> {
        let payload = serde_json::to_string(snapshot)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.set_with_ttl(&job_key(snapshot.job_id), &payload, self.job_ttl)
            .await?;
        debug!(job_id = %snapshot.job_id, "cached job snapshot");
        Ok(())
    }

    async fn job_snapshot(&self, job_id: JobId) -> Result<Option<JobSnapshot>, CacheError> {
        self.get_raw(&job_key(job_id))
            .await?
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| CacheError::Serialization(e.to_string()))
            })
            .transpose()
    }

    async fn invalidate_job(&self, job_id: JobId) -> Result<(), CacheError> {
        let key = job_key(job_id);
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(&key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheError::Command(format!("DEL {key}: {e}")))
    }

    async fn put_result(&self, entry: &CachedResult) -> Result<(), CacheError> {
        let payload = serde_json::to_string(entry)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.set_with_ttl(&result_key(&entry.digest), &payload, self.result_ttl)
            .await?;
        debug!(digest = %entry.digest, "cached digest result");
        Ok(())
    }

    async fn result_for_digest(
        &self,
        digest: &ContentDigest,
    ) -> Result<Option<CachedResult>, CacheError> {
        self.get_raw(&result_key(digest))
            .await?
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| CacheError::Serialization(e.to_string()))
            })
            .transpose()
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| CacheError::Command(format!("PING: {e}")))?;
        Ok(())
    }
}
