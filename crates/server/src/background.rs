//! Low-frequency maintenance tasks: two independent sweeps, each a
//! `tokio::time::interval` loop that does one unit of work per tick and
//! logs outcomes, run as separate background tasks.

use std::time::Duration;

use sqlx::PgPool;
use tracing::{info, warn};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const TEMP_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const EXPORT_STALE_AFTER_HOURS: i64 = 2;

/// §3 QueueItem invariant: "a completed item is removed after N days."
pub async fn run_retention_sweep(pool: PgPool, retention_days: u32) {
    let mut interval = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        match seg_store::QueueItemStore::purge_completed(&pool, retention_days as i64).await {
            Ok(n) if n > 0 => info!(count = n, "purged completed queue items past retention"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "retention sweep failed"),
        }
    }
}

/// §6 "process-wide temp directory auto-cleaned hourly": export jobs
/// stuck past their wall-clock budget have their working directory
/// reclaimed and the job marked failed.
pub async fn run_temp_dir_sweep(pool: PgPool, upload_dir: String) {
    let mut interval = tokio::time::interval(TEMP_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = seg_export::sweep_stale_temp(&pool, &upload_dir, EXPORT_STALE_AFTER_HOURS).await {
            warn!(error = %e, "export temp-directory sweep failed");
        }
    }
}
