//! Standalone scan worker: a competing consumer over the shared stream.
//!
//! Run as many of these as throughput requires; the consumer group and the
//! ledger's conditional claim keep them from stepping on each other.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use filescan_api::config::Config;
use filescan_infra::analyzer::LetterCountAnalyzer;
use filescan_infra::cache::RedisResultCache;
use filescan_infra::ledger::PostgresJobLedger;
use filescan_infra::queue::RedisStreamsQueue;
use filescan_infra::worker::{ScanWorker, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    filescan_observability::init();

    let config = Config::from_env();

    let ledger = PostgresJobLedger::connect(&config.database_url)
        .await
        .context("connecting job ledger")?;
    let cache = RedisResultCache::connect(
        &config.redis_url,
        config.job_cache_ttl,
        config.file_cache_ttl,
    )
    .await
    .context("connecting result cache")?;
    let queue = RedisStreamsQueue::connect(
        &config.redis_url,
        config.stream_name.clone(),
        config.consumer_group.clone(),
        config.visibility_timeout,
    )
    .await
    .context("connecting work queue")?;

    let worker = ScanWorker::new(
        Arc::new(queue),
        Arc::new(ledger),
        Arc::new(cache),
        Arc::new(LetterCountAnalyzer),
        WorkerConfig {
            max_retries: config.max_retries,
            ..WorkerConfig::default()
        },
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    worker.run(shutdown).await;
    Ok(())
}
