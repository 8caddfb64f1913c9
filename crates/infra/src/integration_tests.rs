//! Integration tests for the full ingest -> dedup -> queue -> worker ->
//! cache/ledger pipeline, wired with the in-memory adapters.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use filescan_core::{ContentDigest, Job, JobStatus, LetterCounts};

use crate::analyzer::LetterCountAnalyzer;
use crate::cache::InMemoryResultCache;
use crate::ledger::{InMemoryJobLedger, JobLedger};
use crate::queue::{InMemoryWorkQueue, WorkQueue};
use crate::retention::{RetentionConfig, RetentionManager};
use crate::service::{Scanner, ScannerConfig};
use crate::store::{ContentStore, DiskUsage, StoreError, UsageProbe};
use crate::worker::{ScanWorker, WorkerConfig};

struct FixedUsage(f64);

impl UsageProbe for FixedUsage {
    fn usage(&self) -> Result<DiskUsage, StoreError> {
        Ok(DiskUsage {
            total_bytes: 1_000_000,
            available_bytes: (1_000_000.0 * (100.0 - self.0) / 100.0) as u64,
        })
    }
}

struct Pipeline {
    _dir: tempfile::TempDir,
    store: Arc<ContentStore>,
    ledger: Arc<InMemoryJobLedger>,
    cache: Arc<InMemoryResultCache>,
    queue: Arc<InMemoryWorkQueue>,
    scanner: Scanner,
    worker: ScanWorker,
}

impl Pipeline {
    async fn new(percent_used: f64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ContentStore::open(dir.path()).await.unwrap());
        let ledger = Arc::new(InMemoryJobLedger::new());
        let cache = Arc::new(InMemoryResultCache::default());
        let queue = Arc::new(InMemoryWorkQueue::new(StdDuration::from_secs(60)));

        let scanner = Scanner::new(
            store.clone(),
            Arc::new(FixedUsage(percent_used)),
            ledger.clone(),
            cache.clone(),
            queue.clone(),
            ScannerConfig::default(),
        );
        let worker = ScanWorker::new(
            queue.clone(),
            ledger.clone(),
            cache.clone(),
            Arc::new(LetterCountAnalyzer),
            WorkerConfig {
                consumer_name: "it-worker".into(),
                max_retries: 3,
                idle_backoff: StdDuration::from_millis(1),
            },
        );
        Self {
            _dir: dir,
            store,
            ledger,
            cache,
            queue,
            scanner,
            worker,
        }
    }

    /// Process queued messages until the queue is drained.
    async fn drain(&self) {
        while let Some(delivery) = self.queue.dequeue("it-worker").await.unwrap() {
            self.worker.process(delivery).await.unwrap();
        }
    }
}

const SAMPLE: &[u8] = b"AAABBBCCC Hello World AAABBBCCC";

#[tokio::test]
async fn submit_process_poll_resubmit_dedups() {
    let p = Pipeline::new(50.0).await;

    let first = p.scanner.submit(SAMPLE, "sample.txt").await.unwrap();
    assert!(!first.dedup);
    assert_eq!(first.status, JobStatus::Pending);

    p.drain().await;

    let snapshot = p.scanner.status(first.job_id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Completed);
    let results = snapshot.results.unwrap();
    assert_eq!(results.get('A'), 6);
    assert_eq!(results.get('B'), 6);
    assert_eq!(results.get('C'), 6);
    assert_eq!(results.get('H'), 1);
    assert_eq!(results.get('W'), 1);

    // Resubmitting identical bytes: dedup flag set, identical result served
    // immediately, and no new message hits the queue.
    let queue_len_before = p.queue.stats().await.unwrap().length;
    let second = p.scanner.submit(SAMPLE, "renamed.txt").await.unwrap();
    assert!(second.dedup);
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.results.unwrap(), results);
    assert_eq!(second.job_id, first.job_id);
    assert_eq!(p.queue.stats().await.unwrap().length, queue_len_before);
}

#[tokio::test]
async fn concurrent_identical_uploads_converge_on_identical_results() {
    let p = Pipeline::new(50.0).await;

    // Independent-recomputation policy: the race yields two job ids.
    let (a, b) = tokio::join!(
        p.scanner.submit(SAMPLE, "left.txt"),
        p.scanner.submit(SAMPLE, "right.txt"),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.job_id, b.job_id);
    assert!(!a.dedup);
    assert!(!b.dedup);

    p.drain().await;

    let snap_a = p.scanner.status(a.job_id).await.unwrap();
    let snap_b = p.scanner.status(b.job_id).await.unwrap();
    assert_eq!(snap_a.status, JobStatus::Completed);
    assert_eq!(snap_b.status, JobStatus::Completed);
    assert_eq!(snap_a.results, snap_b.results);
}

#[tokio::test]
async fn results_outlive_reclaimed_blobs_and_reuploads_restore_them() {
    let p = Pipeline::new(50.0).await;

    // A completed job whose content aged past the healthy-tier window.
    let content = b"archived long ago";
    let blob = p.store.ingest(&content[..], 1024).await.unwrap();
    let mut job = Job::new(blob.digest, "old.txt", content.len() as u64, Duration::days(30));
    job.created_at = Utc::now() - Duration::days(10);
    job.start_processing().unwrap();
    let mut counts = LetterCounts::new();
    counts.tally_chunk(content);
    job.complete(counts).unwrap();
    p.ledger.insert(&job).await.unwrap();

    let retention = RetentionManager::new(
        p.store.clone(),
        Arc::new(FixedUsage(50.0)),
        p.ledger.clone(),
        RetentionConfig::default(),
    );
    let report = retention.sweep().await;
    assert_eq!(report.blobs_deleted, 1);
    assert!(!p.store.contains(&blob.digest).await.unwrap());

    // Physical bytes are gone, but the result is still servable by digest.
    let resubmit = p.scanner.submit(&content[..], "old.txt").await.unwrap();
    assert!(resubmit.dedup);
    assert_eq!(resubmit.job_id, job.id);
    assert_eq!(resubmit.results.unwrap().total(), 15);

    // And the re-upload re-stored the blob.
    assert!(p.store.contains(&blob.digest).await.unwrap());
}

#[tokio::test]
async fn crash_before_ack_completes_exactly_once() {
    let p = Pipeline::new(50.0).await;
    let queue = Arc::new(InMemoryWorkQueue::new(StdDuration::from_millis(10)));
    let scanner = Scanner::new(
        p.store.clone(),
        Arc::new(FixedUsage(50.0)),
        p.ledger.clone(),
        p.cache.clone(),
        queue.clone(),
        ScannerConfig::default(),
    );
    let worker = ScanWorker::new(
        queue.clone(),
        p.ledger.clone(),
        p.cache.clone(),
        Arc::new(LetterCountAnalyzer),
        WorkerConfig {
            consumer_name: "survivor".into(),
            max_retries: 3,
            idle_backoff: StdDuration::from_millis(1),
        },
    );

    let submission = scanner.submit(SAMPLE, "crashy.txt").await.unwrap();

    // First claimant takes the message and the claim, then "crashes": no
    // analyzer run, no ack.
    let first = queue.dequeue("doomed").await.unwrap().unwrap();
    assert!(p.ledger.try_claim(submission.job_id).await.unwrap());
    drop(first);

    // After the visibility timeout a second processor gets the message and
    // completes the job exactly once.
    tokio::time::sleep(StdDuration::from_millis(20)).await;
    let redelivered = queue.dequeue("survivor").await.unwrap().unwrap();
    worker.process(redelivered).await.unwrap();

    let snapshot = scanner.status(submission.job_id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.results.unwrap().get('A'), 6);

    // The queue is settled.
    tokio::time::sleep(StdDuration::from_millis(20)).await;
    assert!(queue.dequeue("anyone").await.unwrap().is_none());
}

#[tokio::test]
async fn distinct_content_never_shares_a_stored_path() {
    let p = Pipeline::new(50.0).await;

    let a = p.scanner.submit(&b"content a"[..], "a.txt").await.unwrap();
    let b = p.scanner.submit(&b"content b"[..], "b.txt").await.unwrap();

    let job_a = p.ledger.get(a.job_id).await.unwrap().unwrap();
    let job_b = p.ledger.get(b.job_id).await.unwrap().unwrap();
    assert_ne!(job_a.digest, job_b.digest);
    assert_ne!(p.store.blob_path(&job_a.digest), p.store.blob_path(&job_b.digest));

    // And identical bytes share one: write-once-per-digest.
    assert_eq!(
        p.store.blob_path(&ContentDigest::of(b"content a")),
        p.store.blob_path(&job_a.digest)
    );
}
