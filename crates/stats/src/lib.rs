//! StatsAggregator (§4.7). Grounded on `state.rs`'s `QueueMetrics`
//! (atomics updated by multiple producers, read by a snapshot endpoint),
//! generalized here into a debounced recompute-then-fanout driven by a
//! `notify()` hook, and on `live.rs`'s send-stats-on-connect shape for
//! the initial emission.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::warn;

use seg_bus::EventBus;
use seg_core::events::{event_names, Envelope, Room};
use seg_core::{AppResult, ProjectId, UserId};
use seg_store::{ImageStore, ProjectStore, QueueItemStore};

/// Debounce window per §4.7: "coalesced with a 250 ms debounce per
/// (project|user) to avoid event storms on bulk operations."
const DEBOUNCE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyKey {
    Project(ProjectId),
    User(UserId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectStats {
    pub project_id: ProjectId,
    pub total_images: u32,
    pub segmented: u32,
    pub queued: u32,
    pub processing: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardMetrics {
    pub user_id: UserId,
    pub project_count: u32,
    pub total_images: u32,
    pub queued: u32,
    pub processing: u32,
}

/// What triggered a recompute, carried through for logging only — the
/// aggregator always recomputes from the Store rather than trusting the
/// caller's delta.
#[derive(Debug, Clone, Copy)]
pub enum MutationOp {
    Enqueue,
    Completion,
    Deletion,
    Upload,
}

pub struct StatsAggregator {
    pool: PgPool,
    bus: Arc<EventBus>,
    pending: DashMap<NotifyKey, ()>,
}

impl StatsAggregator {
    pub fn new(pool: PgPool, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self { pool, bus, pending: DashMap::new() })
    }

    pub async fn project_stats(&self, project_id: ProjectId) -> AppResult<ProjectStats> {
        let images = ImageStore::list_for_project(&self.pool, project_id).await?;
        let mut stats = ProjectStats {
            project_id,
            total_images: images.len() as u32,
            segmented: 0,
            queued: 0,
            processing: 0,
            failed: 0,
        };
        for image in &images {
            use seg_store::entities::SegmentationStatus::*;
            match image.status() {
                Segmented => stats.segmented += 1,
                Queued => stats.queued += 1,
                Processing => stats.processing += 1,
                Failed => stats.failed += 1,
                None => {}
            }
        }
        Ok(stats)
    }

    pub async fn dashboard_metrics(&self, user_id: UserId) -> AppResult<DashboardMetrics> {
        let project_ids = ProjectStore::ids_for_user(&self.pool, user_id).await?;
        let mut total_images = 0u32;
        for project_id in &project_ids {
            total_images += ImageStore::list_for_project(&self.pool, *project_id).await?.len() as u32;
        }
        let (queued, processing) = (
            QueueItemStore::queued_ids_for_user(&self.pool, user_id).await?.len() as u32,
            QueueItemStore::count_processing_for_user(&self.pool, user_id).await? as u32,
        );
        Ok(DashboardMetrics {
            user_id,
            project_count: project_ids.len() as u32,
            total_images,
            queued,
            processing,
        })
    }

    /// Called by the owning engine after a mutating operation (§4.7).
    /// Debounces by (project|user): if a recompute for this key is
    /// already scheduled within the debounce window, this call is a
    /// no-op — the scheduled one will see the latest Store state anyway
    /// since it queries fresh.
    pub fn notify(self: &Arc<Self>, key: NotifyKey, op: MutationOp) {
        if self.pending.insert(key, ()).is_some() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            this.pending.remove(&key);
            this.emit(key, op).await;
        });
    }

    async fn emit(&self, key: NotifyKey, op: MutationOp) {
        match key {
            NotifyKey::Project(project_id) => self.emit_project(project_id, op).await,
            NotifyKey::User(user_id) => self.emit_user(user_id, op).await,
        }
    }

    async fn emit_project(&self, project_id: ProjectId, op: MutationOp) {
        let stats = match self.project_stats(project_id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(%project_id, error = %e, ?op, "failed to recompute project stats");
                return;
            }
        };
        let envelope = Envelope::new(event_names::PROJECT_STATS_UPDATE, &stats);
        self.bus.publish(Room::Project(project_id), envelope.clone()).await;

        let recipients = match ProjectStore::accessible_user_ids(&self.pool, project_id).await {
            Ok(ids) => ids,
            Err(_) => return,
        };
        let mut seen = HashSet::new();
        for user_id in recipients {
            if !seen.insert(user_id) {
                continue;
            }
            self.emit_user(user_id, op).await;
        }
    }

    async fn emit_user(&self, user_id: UserId, op: MutationOp) {
        let metrics = match self.dashboard_metrics(user_id).await {
            Ok(m) => m,
            Err(e) => {
                warn!(%user_id, error = %e, ?op, "failed to recompute dashboard metrics");
                return;
            }
        };
        let envelope = Envelope::new(event_names::DASHBOARD_METRICS_UPDATE, &metrics);
        self.bus.publish(Room::User(user_id), envelope).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_key_distinguishes_project_and_user_with_the_same_uuid() {
        let id = uuid::Uuid::new_v4();
        let project_key = NotifyKey::Project(ProjectId::from_uuid(id));
        let user_key = NotifyKey::User(UserId::from_uuid(id));
        let mut set = HashSet::new();
        set.insert(project_key);
        assert!(!set.contains(&user_key));
    }
}
