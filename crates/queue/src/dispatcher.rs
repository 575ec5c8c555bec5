//! Dispatcher loop: weighted round-robin claim across users with queued
//! items, within the global concurrency budget `C`. Grounded on
//! `ingestion/scheduler.rs`'s `run_ingestion_scheduler` (a
//! `tokio::time::interval` poll loop spawning one task per unit of
//! claimed work), widened from single-source polling to per-user fair
//! claiming.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::Semaphore;
use tracing::{debug, error};

use seg_bus::EventBus;
use seg_core::Config;
use seg_inference::InferenceClient;
use seg_render::RenderEngine;
use seg_stats::StatsAggregator;
use seg_store::QueueItemStore;

use crate::worker::run_claimed_item;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Runs forever (until the process exits), polling for queued work and
/// claiming it under the global/per-user concurrency caps from
/// `config.queue`. Intended to be spawned once at startup.
pub async fn run_dispatcher_loop(
    pool: PgPool,
    bus: Arc<EventBus>,
    inference: Arc<dyn InferenceClient>,
    render: Arc<RenderEngine>,
    stats: Arc<StatsAggregator>,
    config: Config,
) {
    let upload_dir = config.upload_dir.clone();
    let global_permits = Arc::new(Semaphore::new(config.queue.global_concurrency as usize));
    let in_flight_per_user: Arc<std::sync::Mutex<HashMap<seg_core::UserId, u32>>> =
        Arc::new(std::sync::Mutex::new(HashMap::new()));
    let retry_budget = config.queue.retry_budget;
    let timeout = Duration::from_secs(config.queue.inference_timeout_secs);
    let per_user_cap = config.queue.per_user_cap;

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        ticker.tick().await;

        let users = match QueueItemStore::users_with_queued_items(&pool).await {
            Ok(u) => u,
            Err(e) => {
                error!(error = %e, "failed to enumerate users with queued items");
                continue;
            }
        };
        if users.is_empty() {
            continue;
        }

        let n = users.len() as u32;
        let per_user_claim = config.queue.global_concurrency.div_ceil(n).max(1);

        for user_id in users {
            let available_global = global_permits.available_permits() as u32;
            if available_global == 0 {
                break;
            }

            let current_for_user = {
                let guard = in_flight_per_user.lock().unwrap();
                *guard.get(&user_id).unwrap_or(&0)
            };
            if current_for_user >= per_user_cap {
                continue;
            }
            let claim_size = per_user_claim.min(per_user_cap - current_for_user).min(available_global);
            if claim_size == 0 {
                continue;
            }

            let claimed = match QueueItemStore::claim_next(&pool, user_id, claim_size as i64).await {
                Ok(items) => items,
                Err(e) => {
                    error!(error = %e, %user_id, "failed to claim queue items");
                    continue;
                }
            };
            if claimed.is_empty() {
                continue;
            }
            debug!(%user_id, count = claimed.len(), "claimed queue items");

            for item in claimed {
                let Ok(permit) = global_permits.clone().try_acquire_owned() else {
                    break;
                };
                {
                    let mut guard = in_flight_per_user.lock().unwrap();
                    *guard.entry(user_id).or_insert(0) += 1;
                }

                let pool = pool.clone();
                let bus = bus.clone();
                let inference = inference.clone();
                let render = render.clone();
                let stats = stats.clone();
                let upload_dir = upload_dir.clone();
                let in_flight = in_flight_per_user.clone();
                let counter_guard = InFlightGuard { user_id, map: in_flight };

                tokio::spawn(async move {
                    let _permit = permit;
                    let _counter_guard = counter_guard;
                    run_claimed_item(
                        &pool,
                        &bus,
                        inference.as_ref(),
                        render.as_ref(),
                        &stats,
                        &upload_dir,
                        item,
                        retry_budget,
                        timeout,
                    )
                    .await;
                });
            }
        }
    }
}

/// Decrements the per-user in-flight counter when a spawned worker task
/// finishes, including on panic unwind.
struct InFlightGuard {
    user_id: seg_core::UserId,
    map: Arc<std::sync::Mutex<HashMap<seg_core::UserId, u32>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut guard = self.map.lock().unwrap();
        if let Some(count) = guard.get_mut(&self.user_id) {
            *count = count.saturating_sub(1);
        }
    }
}
