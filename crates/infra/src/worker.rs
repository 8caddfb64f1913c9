//! Job Processor: a competing consumer over the work queue.
//!
//! Processing is idempotent against at-least-once delivery: before any
//! analyzer work the current ledger state is consulted, so a redelivered
//! message for an already-terminal job is a no-op that just re-acknowledges.
//! The `pending -> processing` claim is the mutual-exclusion point; a racing
//! loser observes a no-op and re-acknowledges without side effects.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use filescan_core::{JobSnapshot, ReleaseOutcome};

use crate::analyzer::Analyzer;
use crate::cache::{CachedResult, ResultCache};
use crate::ledger::{JobLedger, LedgerError};
use crate::queue::{Delivery, QueueError, WorkQueue};

/// Worker identity and policy.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique consumer name within the group.
    pub consumer_name: String,
    /// Retry bound: the job fails terminally once a further attempt would
    /// exceed this many releases.
    pub max_retries: u32,
    /// Sleep between polls when the queue is idle or erroring.
    pub idle_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumer_name: format!("worker-{}", uuid::Uuid::now_v7().simple()),
            max_retries: 3,
            idle_backoff: Duration::from_millis(500),
        }
    }
}

/// What processing one delivery did (observable for tests and logs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Analyzed and completed.
    Completed,
    /// Job was already terminal; re-acknowledged without recomputation.
    AlreadyTerminal,
    /// Another processor won the `pending -> processing` race; no-op.
    ClaimLost,
    /// Recoverable failure; released for retry and left unacknowledged so
    /// the visibility timeout redelivers it.
    Released { retry_count: u32 },
    /// Retry budget spent; job failed terminally.
    Exhausted,
    /// Unrecoverable failure; job failed terminally.
    Failed,
    /// The message referenced a job the ledger does not know.
    UnknownJob,
}

/// Worker error (infrastructure failures only; job failures are outcomes).
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// One worker instance. Run several (threads, processes, hosts) against the
/// same queue group; the claim semantics keep them from colliding.
pub struct ScanWorker {
    queue: Arc<dyn WorkQueue>,
    ledger: Arc<dyn JobLedger>,
    cache: Arc<dyn ResultCache>,
    analyzer: Arc<dyn Analyzer>,
    config: WorkerConfig,
}

impl ScanWorker {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        ledger: Arc<dyn JobLedger>,
        cache: Arc<dyn ResultCache>,
        analyzer: Arc<dyn Analyzer>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            ledger,
            cache,
            analyzer,
            config,
        }
    }

    /// Consume until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(consumer = %self.config.consumer_name, "scan worker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                dequeued = self.queue.dequeue(&self.config.consumer_name) => {
                    match dequeued {
                        Ok(Some(delivery)) => {
                            let job_id = delivery.message.job_id;
                            match self.process(delivery).await {
                                Ok(outcome) => debug!(%job_id, ?outcome, "delivery processed"),
                                Err(e) => {
                                    error!(%job_id, error = %e, "delivery processing errored");
                                    tokio::time::sleep(self.config.idle_backoff).await;
                                }
                            }
                        }
                        Ok(None) => tokio::time::sleep(self.config.idle_backoff).await,
                        Err(e) => {
                            error!(error = %e, "queue read failed");
                            tokio::time::sleep(self.config.idle_backoff).await;
                        }
                    }
                }
            }
        }
        info!(consumer = %self.config.consumer_name, "scan worker stopped");
    }

    /// Process one delivery end to end.
    pub async fn process(&self, delivery: Delivery) -> Result<ProcessOutcome, WorkerError> {
        let message = &delivery.message;
        let job_id = message.job_id;

        let Some(job) = self.ledger.get(job_id).await? else {
            warn!(%job_id, "message references unknown job, dropping");
            self.queue.ack(&delivery.id).await?;
            return Ok(ProcessOutcome::UnknownJob);
        };

        // Idempotent replay: terminal work is done, just settle the message.
        if job.is_terminal() {
            debug!(%job_id, status = %job.status, "job already terminal, re-acknowledging");
            self.queue.ack(&delivery.id).await?;
            return Ok(ProcessOutcome::AlreadyTerminal);
        }

        // A redelivered message for a job stuck in `processing` means the
        // previous claimant crashed before acknowledging. Return the job to
        // `pending` (counting the retry) before claiming it ourselves.
        if job.status == filescan_core::JobStatus::Processing {
            match self.ledger.release_for_retry(job_id, self.config.max_retries).await {
                Ok(ReleaseOutcome::Requeued { retry_count }) => {
                    info!(%job_id, retry_count, "released phantom claim from a crashed processor");
                }
                Ok(ReleaseOutcome::Exhausted) => {
                    self.refresh_job_cache(job_id).await;
                    self.queue.ack(&delivery.id).await?;
                    return Ok(ProcessOutcome::Exhausted);
                }
                // Someone else resolved it in the meantime; treat as lost.
                Err(LedgerError::InvalidTransition { .. }) => {
                    self.queue.ack(&delivery.id).await?;
                    return Ok(ProcessOutcome::ClaimLost);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !self.ledger.try_claim(job_id).await? {
            // The losing processor of the claim race: no-op, re-acknowledge.
            debug!(%job_id, "lost the claim race");
            self.queue.ack(&delivery.id).await?;
            return Ok(ProcessOutcome::ClaimLost);
        }
        // Polls should read the ledger's `processing` state, not a stale
        // snapshot.
        self.invalidate_job_cache(job_id).await;

        match self.analyzer.analyze(Path::new(&message.blob_path)).await {
            Ok(counts) => {
                let job = self.ledger.complete(job_id, &counts).await?;
                let entry = CachedResult {
                    digest: message.digest,
                    job_id,
                    results: counts,
                    file_size: job.file_size,
                };
                if let Err(e) = self.cache.put_result(&entry).await {
                    warn!(%job_id, error = %e, "failed to cache digest result");
                }
                if let Err(e) = self.cache.put_job_snapshot(&JobSnapshot::from(&job)).await {
                    warn!(%job_id, error = %e, "failed to cache job snapshot");
                }
                self.queue.ack(&delivery.id).await?;
                info!(%job_id, digest = %message.digest, "job completed");
                Ok(ProcessOutcome::Completed)
            }
            Err(analysis) if analysis.is_retriable() => {
                warn!(%job_id, error = %analysis, "analysis failed, releasing for retry");
                match self.ledger.release_for_retry(job_id, self.config.max_retries).await? {
                    ReleaseOutcome::Requeued { retry_count } => {
                        // Deliberately unacknowledged: the visibility timeout
                        // will hand the message to another consumer.
                        self.invalidate_job_cache(job_id).await;
                        Ok(ProcessOutcome::Released { retry_count })
                    }
                    ReleaseOutcome::Exhausted => {
                        self.refresh_job_cache(job_id).await;
                        self.queue.ack(&delivery.id).await?;
                        warn!(%job_id, "retry budget exhausted, job failed");
                        Ok(ProcessOutcome::Exhausted)
                    }
                }
            }
            Err(analysis) => {
                let job = self.ledger.fail(job_id, &analysis.to_string()).await?;
                if let Err(e) = self.cache.put_job_snapshot(&JobSnapshot::from(&job)).await {
                    warn!(%job_id, error = %e, "failed to cache job snapshot");
                }
                self.queue.ack(&delivery.id).await?;
                warn!(%job_id, error = %analysis, "job failed terminally");
                Ok(ProcessOutcome::Failed)
            }
        }
    }

    async fn invalidate_job_cache(&self, job_id: filescan_core::JobId) {
        if let Err(e) = self.cache.invalidate_job(job_id).await {
            warn!(%job_id, error = %e, "failed to invalidate job cache");
        }
    }

    async fn refresh_job_cache(&self, job_id: filescan_core::JobId) {
        match self.ledger.get(job_id).await {
            Ok(Some(job)) => {
                if let Err(e) = self.cache.put_job_snapshot(&JobSnapshot::from(&job)).await {
                    warn!(%job_id, error = %e, "failed to cache job snapshot");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(%job_id, error = %e, "failed to reload job for cache refresh"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use filescan_core::{ContentDigest, Job, JobStatus, LetterCounts};

    use crate::analyzer::{AnalysisError, LetterCountAnalyzer};
    use crate::cache::InMemoryResultCache;
    use crate::ledger::InMemoryJobLedger;
    use crate::queue::{InMemoryWorkQueue, ScanMessage};

    struct Fixture {
        queue: Arc<InMemoryWorkQueue>,
        ledger: Arc<InMemoryJobLedger>,
        cache: Arc<InMemoryResultCache>,
        _dir: tempfile::TempDir,
        blob_path: PathBuf,
        content: &'static [u8],
    }

    impl Fixture {
        fn new(content: &'static [u8]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let blob_path = dir.path().join("blob");
            std::fs::write(&blob_path, content).unwrap();
            Self {
                queue: Arc::new(InMemoryWorkQueue::new(Duration::from_millis(10))),
                ledger: Arc::new(InMemoryJobLedger::new()),
                cache: Arc::new(InMemoryResultCache::default()),
                _dir: dir,
                blob_path,
                content,
            }
        }

        async fn submit_job(&self) -> (Job, Delivery) {
            let job = Job::new(
                ContentDigest::of(self.content),
                "file.txt",
                self.content.len() as u64,
                ChronoDuration::days(7),
            );
            self.ledger.insert(&job).await.unwrap();
            let message = ScanMessage {
                job_id: job.id,
                digest: job.digest,
                blob_path: self.blob_path.display().to_string(),
                file_size: job.file_size,
            };
            self.queue.enqueue(&message).await.unwrap();
            let delivery = self.queue.dequeue("test-worker").await.unwrap().unwrap();
            (job, delivery)
        }

        fn worker(&self, analyzer: Arc<dyn Analyzer>, max_retries: u32) -> ScanWorker {
            ScanWorker::new(
                self.queue.clone(),
                self.ledger.clone(),
                self.cache.clone(),
                analyzer,
                WorkerConfig {
                    consumer_name: "test-worker".into(),
                    max_retries,
                    idle_backoff: Duration::from_millis(1),
                },
            )
        }
    }

    /// Counts invocations; fails the first `failures` calls with an I/O error.
    struct FlakyAnalyzer {
        calls: AtomicU32,
        failures: u32,
    }

    #[async_trait]
    impl Analyzer for FlakyAnalyzer {
        async fn analyze(
            &self,
            blob_path: &std::path::Path,
        ) -> Result<LetterCounts, AnalysisError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(AnalysisError::Io(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "transient",
                )));
            }
            LetterCountAnalyzer.analyze(blob_path).await
        }
    }

    #[tokio::test]
    async fn completes_a_job_and_caches_both_key_spaces() {
        let fx = Fixture::new(b"AAABBBCCC Hello World AAABBBCCC");
        let (job, delivery) = fx.submit_job().await;
        let worker = fx.worker(Arc::new(LetterCountAnalyzer), 3);

        let outcome = worker.process(delivery).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed);

        let stored = fx.ledger.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.results.unwrap().get('A'), 6);

        let cached = fx.cache.result_for_digest(&job.digest).await.unwrap().unwrap();
        assert_eq!(cached.job_id, job.id);
        let snap = fx.cache.job_snapshot(job.id).await.unwrap().unwrap();
        assert_eq!(snap.status, JobStatus::Completed);

        // Acknowledged: nothing left to deliver.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fx.queue.dequeue("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn redelivery_for_a_completed_job_is_a_noop() {
        let fx = Fixture::new(b"idempotent");
        let (job, delivery) = fx.submit_job().await;

        let counting = Arc::new(FlakyAnalyzer {
            calls: AtomicU32::new(0),
            failures: 0,
        });
        let worker = fx.worker(counting.clone(), 3);
        worker.process(delivery).await.unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);

        // Simulate a duplicate delivery of the same message.
        let message = ScanMessage {
            job_id: job.id,
            digest: job.digest,
            blob_path: fx.blob_path.display().to_string(),
            file_size: job.file_size,
        };
        fx.queue.enqueue(&message).await.unwrap();
        let duplicate = fx.queue.dequeue("test-worker").await.unwrap().unwrap();

        let outcome = worker.process(duplicate).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::AlreadyTerminal);
        // No recomputation happened.
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_retry_until_the_bound_then_fail() {
        let fx = Fixture::new(b"flaky");
        let (job, delivery) = fx.submit_job().await;
        let worker = fx.worker(
            Arc::new(FlakyAnalyzer {
                calls: AtomicU32::new(0),
                failures: u32::MAX,
            }),
            2,
        );

        // First attempt: released with retry 1, message left unacked.
        let outcome = worker.process(delivery).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Released { retry_count: 1 });
        assert_eq!(fx.ledger.get(job.id).await.unwrap().unwrap().status, JobStatus::Pending);

        // Visibility timeout expires; the message comes back.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let redelivered = fx.queue.dequeue("test-worker").await.unwrap().unwrap();
        assert_eq!(redelivered.delivery_count, 2);
        let outcome = worker.process(redelivered).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Released { retry_count: 2 });

        // Third delivery exceeds the bound of 2: terminal failure.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let redelivered = fx.queue.dequeue("test-worker").await.unwrap().unwrap();
        let outcome = worker.process(redelivered).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Exhausted);

        let stored = fx.ledger.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 2);
        assert!(stored.error_message.unwrap().contains("exhausted"));

        // Settled: no further deliveries.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fx.queue.dequeue("test-worker").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_blob_fails_terminally_with_a_readable_message() {
        let fx = Fixture::new(b"vanishing");
        let (job, delivery) = fx.submit_job().await;
        std::fs::remove_file(&fx.blob_path).unwrap();

        let worker = fx.worker(Arc::new(LetterCountAnalyzer), 3);
        let outcome = worker.process(delivery).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Failed);

        let stored = fx.ledger.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error_message.unwrap().contains("blob not found"));
    }

    #[tokio::test]
    async fn crashed_claimants_phantom_transition_is_recovered() {
        let fx = Fixture::new(b"crashed worker");
        let (job, delivery) = fx.submit_job().await;

        // A processor claimed the job, then died without acknowledging.
        assert!(fx.ledger.try_claim(job.id).await.unwrap());
        // The visibility timeout elapses and the message is redelivered.
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(delivery);
        let redelivered = fx.queue.dequeue("survivor").await.unwrap().unwrap();
        assert_eq!(redelivered.delivery_count, 2);

        let worker = fx.worker(Arc::new(LetterCountAnalyzer), 3);
        let outcome = worker.process(redelivered).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed);

        let stored = fx.ledger.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        // The phantom release was counted.
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn unknown_job_is_dropped_with_an_ack() {
        let fx = Fixture::new(b"ghost");
        let message = ScanMessage {
            job_id: filescan_core::JobId::new(),
            digest: ContentDigest::of(b"ghost"),
            blob_path: fx.blob_path.display().to_string(),
            file_size: 5,
        };
        fx.queue.enqueue(&message).await.unwrap();
        let delivery = fx.queue.dequeue("test-worker").await.unwrap().unwrap();

        let worker = fx.worker(Arc::new(LetterCountAnalyzer), 3);
        let outcome = worker.process(delivery).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::UnknownJob);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fx.queue.dequeue("test-worker").await.unwrap().is_none());
    }
}
