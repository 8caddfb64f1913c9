//! Dedup Resolver: cache first, ledger second, miss last.
//!
//! Policy for concurrent identical-content uploads: independent
//! recomputation. A digest with only in-flight (`pending`/`processing`)
//! jobs resolves as a miss and gets its own job; the duplicates converge on
//! identical results without cross-job blocking.

use std::sync::Arc;

use tracing::{debug, warn};

use filescan_core::ContentDigest;

use crate::cache::{CachedResult, ResultCache};
use crate::ledger::{JobLedger, LedgerError};

/// Outcome of resolving a freshly computed digest.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A result was already cached for this digest.
    CacheHit(CachedResult),
    /// No cache entry, but a prior completed job exists; the cache has been
    /// repopulated from it.
    LedgerHit(CachedResult),
    /// New work.
    Miss,
}

impl Resolution {
    /// The `dedup_flag` of §submit: true for either kind of hit.
    pub fn is_hit(&self) -> bool {
        !matches!(self, Resolution::Miss)
    }
}

/// Decides {cache-hit, ledger-hit, miss} for a digest.
pub struct DedupResolver {
    cache: Arc<dyn ResultCache>,
    ledger: Arc<dyn JobLedger>,
}

impl DedupResolver {
    pub fn new(cache: Arc<dyn ResultCache>, ledger: Arc<dyn JobLedger>) -> Self {
        Self { cache, ledger }
    }

    pub async fn resolve(&self, digest: &ContentDigest) -> Result<Resolution, LedgerError> {
        // Cache consult is advisory: a failure falls through to the ledger.
        match self.cache.result_for_digest(digest).await {
            Ok(Some(hit)) => {
                debug!(%digest, "dedup cache hit");
                return Ok(Resolution::CacheHit(hit));
            }
            Ok(None) => {}
            Err(e) => warn!(%digest, error = %e, "result cache read failed, consulting ledger"),
        }

        // Tie-break across prior jobs: most recently completed wins.
        let Some(job) = self.ledger.latest_completed_for_digest(digest).await? else {
            return Ok(Resolution::Miss);
        };
        let Some(results) = job.results else {
            // A completed job without results is a data bug; do not serve it.
            warn!(job_id = %job.id, "completed job has no results, treating as miss");
            return Ok(Resolution::Miss);
        };

        let entry = CachedResult {
            digest: *digest,
            job_id: job.id,
            results,
            file_size: job.file_size,
        };
        if let Err(e) = self.cache.put_result(&entry).await {
            warn!(%digest, error = %e, "failed to repopulate result cache");
        }
        debug!(%digest, job_id = %job.id, "dedup ledger hit");
        Ok(Resolution::LedgerHit(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use filescan_core::{Job, LetterCounts};

    use crate::cache::InMemoryResultCache;
    use crate::ledger::InMemoryJobLedger;

    fn setup() -> (Arc<InMemoryResultCache>, Arc<InMemoryJobLedger>, DedupResolver) {
        let cache = Arc::new(InMemoryResultCache::default());
        let ledger = Arc::new(InMemoryJobLedger::new());
        let resolver = DedupResolver::new(cache.clone(), ledger.clone());
        (cache, ledger, resolver)
    }

    fn completed_job(content: &[u8]) -> Job {
        let mut job = Job::new(
            ContentDigest::of(content),
            "done.txt",
            content.len() as u64,
            Duration::days(7),
        );
        let mut counts = LetterCounts::new();
        counts.tally_chunk(content);
        job.start_processing().unwrap();
        job.complete(counts).unwrap();
        job
    }

    #[tokio::test]
    async fn unknown_digest_is_a_miss() {
        let (_, _, resolver) = setup();
        let resolution = resolver.resolve(&ContentDigest::of(b"new")).await.unwrap();
        assert_eq!(resolution, Resolution::Miss);
        assert!(!resolution.is_hit());
    }

    #[tokio::test]
    async fn cached_result_short_circuits() {
        let (cache, _, resolver) = setup();
        let digest = ContentDigest::of(b"cached");
        let entry = CachedResult {
            digest,
            job_id: filescan_core::JobId::new(),
            results: LetterCounts::new(),
            file_size: 6,
        };
        cache.put_result(&entry).await.unwrap();

        let resolution = resolver.resolve(&digest).await.unwrap();
        assert_eq!(resolution, Resolution::CacheHit(entry));
    }

    #[tokio::test]
    async fn ledger_hit_repopulates_the_cache() {
        let (cache, ledger, resolver) = setup();
        let job = completed_job(b"ledger only");
        ledger.insert(&job).await.unwrap();

        let resolution = resolver.resolve(&job.digest).await.unwrap();
        let Resolution::LedgerHit(entry) = resolution else {
            panic!("expected ledger hit");
        };
        assert_eq!(entry.job_id, job.id);

        // The cache now answers directly.
        assert_eq!(
            cache.result_for_digest(&job.digest).await.unwrap(),
            Some(entry.clone())
        );
        let again = resolver.resolve(&job.digest).await.unwrap();
        assert_eq!(again, Resolution::CacheHit(entry));
    }

    #[tokio::test]
    async fn in_flight_jobs_do_not_dedup() {
        let (_, ledger, resolver) = setup();
        let pending = Job::new(ContentDigest::of(b"racing"), "race.txt", 6, Duration::days(7));
        ledger.insert(&pending).await.unwrap();

        // Independent-recomputation policy: a pending twin is still a miss.
        let resolution = resolver.resolve(&pending.digest).await.unwrap();
        assert_eq!(resolution, Resolution::Miss);
    }
}
