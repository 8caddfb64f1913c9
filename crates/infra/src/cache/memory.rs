//! In-memory cache with per-entry expiry, for dev/test.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use filescan_core::{ContentDigest, JobId, JobSnapshot};

use super::{job_key, result_key, CacheError, CachedResult, ResultCache};

#[derive(Debug)]
struct Entry {
    expires_at: Instant,
    payload: String,
}

/// Single-map cache keyed by the same strings the Redis implementation uses;
/// expiry is checked lazily on read.
#[derive(Debug)]
pub struct InMemoryResultCache {
    entries: Mutex<HashMap<String, Entry>>,
    job_ttl: Duration,
    result_ttl: Duration,
}

impl InMemoryResultCache {
    pub fn new(job_ttl: Duration, result_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            job_ttl,
            result_ttl,
        }
    }

    fn put(&self, key: String, payload: String, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key,
            Entry {
                expires_at: Instant::now() + ttl,
                payload,
            },
        );
    }

    fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.payload.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

impl Default for InMemoryResultCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600), Duration::from_secs(86400))
    }
}

#[async_trait]
impl ResultCache for InMemoryResultCache {
    async fn put_job_snapshot(&self, snapshot: &JobSnapshot) -> Result<(), CacheError> {
        let payload = serde_json::to_string(snapshot)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.put(job_key(snapshot.job_id), payload, self.job_ttl);
        Ok(())
    }

    async fn job_snapshot(&self, job_id: JobId) -> Result<Option<JobSnapshot>, CacheError> {
        self.get(&job_key(job_id))
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| CacheError::Serialization(e.to_string()))
            })
            .transpose()
    }

    async fn invalidate_job(&self, job_id: JobId) -> Result<(), CacheError> {
        self.entries.lock().unwrap().remove(&job_key(job_id));
        Ok(())
    }

    async fn put_result(&self, entry: &CachedResult) -> Result<(), CacheError> {
        let payload = serde_json::to_string(entry)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.put(result_key(&entry.digest), payload, self.result_ttl);
        Ok(())
    }

    async fn result_for_digest(
        &self,
        digest: &ContentDigest,
    ) -> Result<Option<CachedResult>, CacheError> {
        self.get(&result_key(digest))
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| CacheError::Serialization(e.to_string()))
            })
            .transpose()
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use filescan_core::{JobStatus, LetterCounts};

    fn snapshot(job_id: JobId) -> JobSnapshot {
        JobSnapshot {
            job_id,
            status: JobStatus::Pending,
            original_filename: "a.txt".into(),
            file_size: 3,
            results: None,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn job_snapshots_round_trip() {
        let cache = InMemoryResultCache::default();
        let snap = snapshot(JobId::new());

        cache.put_job_snapshot(&snap).await.unwrap();
        assert_eq!(cache.job_snapshot(snap.job_id).await.unwrap(), Some(snap.clone()));

        cache.invalidate_job(snap.job_id).await.unwrap();
        assert_eq!(cache.job_snapshot(snap.job_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_read_as_misses() {
        let cache = InMemoryResultCache::new(Duration::ZERO, Duration::ZERO);
        let snap = snapshot(JobId::new());
        cache.put_job_snapshot(&snap).await.unwrap();
        assert_eq!(cache.job_snapshot(snap.job_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn key_spaces_are_disjoint() {
        let cache = InMemoryResultCache::default();
        let digest = ContentDigest::of(b"payload");
        let entry = CachedResult {
            digest,
            job_id: JobId::new(),
            results: LetterCounts::new(),
            file_size: 7,
        };

        cache.put_result(&entry).await.unwrap();
        assert_eq!(cache.result_for_digest(&digest).await.unwrap(), Some(entry.clone()));
        // The job-status space does not see the result entry.
        assert_eq!(cache.job_snapshot(entry.job_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_digest_is_a_miss() {
        let cache = InMemoryResultCache::default();
        let miss = cache
            .result_for_digest(&ContentDigest::of(b"never stored"))
            .await
            .unwrap();
        assert!(miss.is_none());
    }
}
