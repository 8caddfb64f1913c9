//! Infrastructure wiring: build the scanner and its collaborators from
//! config, switching between in-memory and persistent stacks.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use filescan_infra::analyzer::LetterCountAnalyzer;
use filescan_infra::cache::{InMemoryResultCache, RedisResultCache, ResultCache};
use filescan_infra::ledger::{InMemoryJobLedger, JobLedger, PostgresJobLedger};
use filescan_infra::queue::{InMemoryWorkQueue, RedisStreamsQueue, WorkQueue};
use filescan_infra::retention::{RetentionConfig, RetentionManager};
use filescan_infra::service::{Scanner, ScannerConfig};
use filescan_infra::store::{ContentStore, UsageProbe};
use filescan_infra::worker::{ScanWorker, WorkerConfig};

use crate::config::Config;

/// Everything the handlers need, behind the subsystem ports.
pub struct AppServices {
    pub scanner: Scanner,
    pub ledger: Arc<dyn JobLedger>,
    pub cache: Arc<dyn ResultCache>,
    pub queue: Arc<dyn WorkQueue>,
    pub store: Arc<ContentStore>,
    pub usage: Arc<dyn UsageProbe>,
    pub config: Config,
}

/// Build services per `USE_PERSISTENT_STORES`.
///
/// In-memory mode also runs a scan worker in-process so the dev loop works
/// with a single binary; persistent mode expects `filescan-worker`
/// processes to consume the stream.
pub async fn build_services(config: Config) -> anyhow::Result<AppServices> {
    let store = Arc::new(
        ContentStore::open(&config.file_storage_path)
            .await
            .context("opening content store")?,
    );
    let usage: Arc<dyn UsageProbe> = store.clone();

    let (ledger, cache, queue): (Arc<dyn JobLedger>, Arc<dyn ResultCache>, Arc<dyn WorkQueue>) =
        if config.use_persistent_stores {
            info!("wiring persistent stores (postgres + redis)");
            let ledger = PostgresJobLedger::connect(&config.database_url)
                .await
                .context("connecting job ledger")?;
            let cache =
                RedisResultCache::connect(&config.redis_url, config.job_cache_ttl, config.file_cache_ttl)
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
            (Arc::new(ledger), Arc::new(cache), Arc::new(queue))
        } else {
            info!("wiring in-memory stores (dev/test mode)");
            (
                Arc::new(InMemoryJobLedger::new()),
                Arc::new(InMemoryResultCache::new(config.job_cache_ttl, config.file_cache_ttl)),
                Arc::new(InMemoryWorkQueue::new(config.visibility_timeout)),
            )
        };

    let scanner = Scanner::new(
        store.clone(),
        usage.clone(),
        ledger.clone(),
        cache.clone(),
        queue.clone(),
        ScannerConfig {
            max_upload_bytes: config.max_upload_bytes,
            job_retention: chrono::Duration::days(config.retention_days),
        },
    );

    if !config.use_persistent_stores {
        spawn_inprocess_worker(&config, queue.clone(), ledger.clone(), cache.clone());
    }

    Ok(AppServices {
        scanner,
        ledger,
        cache,
        queue,
        store,
        usage,
        config,
    })
}

fn spawn_inprocess_worker(
    config: &Config,
    queue: Arc<dyn WorkQueue>,
    ledger: Arc<dyn JobLedger>,
    cache: Arc<dyn ResultCache>,
) {
    let worker = ScanWorker::new(
        queue,
        ledger,
        cache,
        Arc::new(LetterCountAnalyzer),
        WorkerConfig {
            max_retries: config.max_retries,
            ..WorkerConfig::default()
        },
    );
    tokio::spawn(async move {
        // Lives for the whole process; the token only exists to satisfy the
        // worker's shutdown contract.
        worker.run(CancellationToken::new()).await;
    });
    info!("in-process scan worker started");
}

/// Spawn the periodic retention sweep for this process.
pub fn spawn_retention(services: &AppServices, shutdown: CancellationToken) {
    let manager = RetentionManager::new(
        services.store.clone(),
        services.usage.clone(),
        services.ledger.clone(),
        RetentionConfig {
            sweep_interval: services.config.cleanup_interval,
            temp_max_age: services.config.temp_max_age,
        },
    );
    tokio::spawn(async move {
        manager.run_periodic(shutdown).await;
    });
}
