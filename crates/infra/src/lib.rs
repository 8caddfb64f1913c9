//! Infrastructure layer: content store, ledger, cache, queue, workers.
//!
//! Every subsystem has a port (trait) plus an in-memory implementation for
//! dev/test; the persistent implementations (Postgres ledger, Redis cache and
//! stream queue) live behind the same ports. The `redis` cargo feature gates
//! the Redis-backed adapters.

pub mod analyzer;
pub mod cache;
pub mod dedup;
pub mod ledger;
pub mod queue;
pub mod retention;
pub mod service;
pub mod store;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use analyzer::{AnalysisError, Analyzer, LetterCountAnalyzer};
pub use cache::{CacheError, CachedResult, ResultCache};
pub use dedup::{DedupResolver, Resolution};
pub use ledger::{JobLedger, LedgerError};
pub use queue::{Delivery, QueueError, QueueStats, ScanMessage, WorkQueue};
pub use retention::{RetentionConfig, RetentionManager, StorageTier, SweepReport};
pub use service::{ScanError, Scanner, ScannerConfig, Submission};
pub use store::{ContentStore, DiskUsage, StoreError, StoredBlob, UsageProbe};
pub use worker::{ProcessOutcome, ScanWorker, WorkerConfig};
