//! Retention Manager: tiered, disk-pressure-driven blob eviction.
//!
//! Runs on a fixed interval, independent of request traffic. Utilization is
//! read fresh from the [`UsageProbe`] at sweep time, never cached, so the
//! tier decision cannot go stale against concurrent uploads.
//!
//! Deleting a blob never touches its ledger rows or cached results: a
//! computed result stays servable by digest after the bytes are reclaimed,
//! and a re-upload of the same content simply re-stores the blob.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::ledger::JobLedger;
use crate::store::{ContentStore, UsageProbe};

/// Disk-pressure tier, selected from utilization percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTier {
    /// < 85% used.
    Healthy,
    /// 85–90% used.
    Warning,
    /// 90–95% used.
    Critical,
    /// >= 95% used: shortest retention, and new uploads are rejected.
    Emergency,
}

impl StorageTier {
    pub fn for_percent_used(percent_used: f64) -> Self {
        if percent_used >= 95.0 {
            StorageTier::Emergency
        } else if percent_used >= 90.0 {
            StorageTier::Critical
        } else if percent_used >= 85.0 {
            StorageTier::Warning
        } else {
            StorageTier::Healthy
        }
    }

    /// Maximum blob age retained under this tier.
    pub fn max_age(&self) -> Duration {
        match self {
            StorageTier::Healthy => Duration::days(7),
            StorageTier::Warning => Duration::days(3),
            StorageTier::Critical => Duration::days(1),
            StorageTier::Emergency => Duration::hours(12),
        }
    }

    /// Emergency tier stops accepting new uploads until utilization drops.
    pub fn rejects_uploads(&self) -> bool {
        matches!(self, StorageTier::Emergency)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageTier::Healthy => "healthy",
            StorageTier::Warning => "warning",
            StorageTier::Critical => "critical",
            StorageTier::Emergency => "emergency",
        }
    }
}

/// Sweep cadence and temp-file policy.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub sweep_interval: StdDuration,
    /// Orphaned `tmp_*` files older than this are removed on every sweep.
    pub temp_max_age: StdDuration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            sweep_interval: StdDuration::from_secs(3600),
            temp_max_age: StdDuration::from_secs(3600),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub tier: Option<StorageTier>,
    pub percent_used: Option<f64>,
    pub blobs_deleted: u64,
    pub blobs_skipped_in_flight: u64,
    pub jobs_expired: u64,
    pub temp_files_removed: u64,
}

/// Periodic storage steward.
pub struct RetentionManager {
    store: Arc<ContentStore>,
    usage: Arc<dyn UsageProbe>,
    ledger: Arc<dyn JobLedger>,
    config: RetentionConfig,
}

impl RetentionManager {
    pub fn new(
        store: Arc<ContentStore>,
        usage: Arc<dyn UsageProbe>,
        ledger: Arc<dyn JobLedger>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            store,
            usage,
            ledger,
            config,
        }
    }

    /// Run one sweep. Per-blob failures are logged and skipped; the sweep
    /// itself never fails.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.store.sweep_temp(self.config.temp_max_age).await {
            Ok(removed) => report.temp_files_removed = removed,
            Err(e) => warn!(error = %e, "temp-file sweep failed"),
        }

        match self.usage.usage() {
            Ok(usage) => {
                let percent_used = usage.percent_used();
                let tier = StorageTier::for_percent_used(percent_used);
                report.tier = Some(tier);
                report.percent_used = Some(percent_used);
                info!(tier = tier.as_str(), percent_used, "retention sweep tier selected");
                self.evict_aged_blobs(tier, &mut report).await;
            }
            // Without a utilization reading the tier is unknowable; skip
            // eviction rather than guess.
            Err(e) => error!(error = %e, "cannot read storage utilization, skipping eviction"),
        }

        match self.ledger.delete_expired(Utc::now()).await {
            Ok(expired) => report.jobs_expired = expired,
            Err(e) => warn!(error = %e, "expired-job deletion failed"),
        }

        info!(
            blobs_deleted = report.blobs_deleted,
            skipped_in_flight = report.blobs_skipped_in_flight,
            jobs_expired = report.jobs_expired,
            temp_files_removed = report.temp_files_removed,
            "retention sweep completed"
        );
        report
    }

    async fn evict_aged_blobs(&self, tier: StorageTier, report: &mut SweepReport) {
        let cutoff = Utc::now() - tier.max_age();
        let stale = match self.ledger.stale_digests(cutoff).await {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "stale-digest query failed, skipping eviction");
                return;
            }
        };

        for digest in stale {
            // A blob referenced by an in-flight job must survive even if
            // aged out, or the Analyzer's read would fail under it.
            match self.ledger.digest_in_flight(&digest).await {
                Ok(true) => {
                    report.blobs_skipped_in_flight += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(%digest, error = %e, "in-flight check failed, keeping blob");
                    report.blobs_skipped_in_flight += 1;
                    continue;
                }
            }
            match self.store.delete(&digest).await {
                Ok(true) => report.blobs_deleted += 1,
                Ok(false) => {}
                Err(e) => warn!(%digest, error = %e, "blob deletion failed"),
            }
        }
    }

    /// Sweep on a fixed interval until cancelled.
    pub async fn run_periodic(&self, shutdown: CancellationToken) {
        info!(interval_secs = self.config.sweep_interval.as_secs(), "retention manager started");
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup isn't a sweep.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
        info!("retention manager stopped");
    }
}
