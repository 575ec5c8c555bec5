//! Segmentation Queue & Dispatcher (§4.2). Generalizes
//! `ingestion/job_runner.rs`'s single-job status-machine-under-a-lock
//! into a multi-user, fairness-capped dispatcher loop, and
//! `ingestion/scheduler.rs`'s poll loop into the weighted round-robin
//! scheduling described in §4.2 "Scheduling".

mod dispatcher;
mod worker;

use std::sync::Arc;

use sqlx::PgPool;
use tracing::{info, warn};

use seg_bus::EventBus;
use seg_core::events::{event_names, Envelope, QueueUpdateEvent, Room};
use seg_core::{AppError, AppResult, ImageId, ProjectId, QueueItemId, UserId};
use seg_store::{NewQueueItem, QueueItemStore};

pub use dispatcher::run_dispatcher_loop;

pub struct EnqueueResult {
    pub batch_id: uuid::Uuid,
    pub item_ids: Vec<QueueItemId>,
}

pub struct CancelResult {
    pub cancelled: Vec<QueueItemId>,
    pub skipped: Vec<QueueItemId>,
}

/// Composition-root facade over the queue store + dispatcher, per §4.2
/// "Contract". The dispatcher loop itself runs as a background task
/// (see [`run_dispatcher_loop`]); this type is the synchronous-looking
/// API the HTTP layer calls.
pub struct QueueEngine {
    pool: PgPool,
    bus: Arc<EventBus>,
}

impl QueueEngine {
    pub fn new(pool: PgPool, bus: Arc<EventBus>) -> Self {
        Self { pool, bus }
    }

    pub async fn enqueue(
        &self,
        user_id: UserId,
        project_id: ProjectId,
        image_ids: Vec<ImageId>,
        model: String,
        threshold: f32,
        detect_holes: bool,
    ) -> AppResult<EnqueueResult> {
        if image_ids.is_empty() {
            return Err(AppError::InvalidInput("imageIds must not be empty".into()));
        }
        let batch_id = uuid::Uuid::new_v4();
        let items = image_ids
            .iter()
            .map(|&image_id| NewQueueItem {
                user_id,
                project_id,
                image_id,
                model: model.clone(),
                threshold,
                detect_holes,
                batch_id,
            })
            .collect();

        let item_ids = QueueItemStore::create_batch(&self.pool, items).await?;

        let envelope = Envelope::new(
            event_names::QUEUE_UPDATE,
            QueueUpdateEvent { project_id, added: item_ids.clone() },
        );
        self.bus
            .publish_to([Room::Project(project_id), Room::User(user_id)], envelope)
            .await;

        Ok(EnqueueResult { batch_id, item_ids })
    }

    pub async fn cancel_items(&self, user_id: UserId, ids: Vec<QueueItemId>) -> AppResult<CancelResult> {
        let (cancelled, skipped) = QueueItemStore::cancel_queued(&self.pool, user_id, &ids).await?;
        self.emit_cancellation_events(user_id, &cancelled).await;
        Ok(CancelResult {
            cancelled: cancelled.into_iter().map(|(id, _)| id).collect(),
            skipped,
        })
    }

    pub async fn cancel_project(&self, user_id: UserId, project_id: ProjectId) -> AppResult<CancelResult> {
        let ids = QueueItemStore::queued_ids_for_project(&self.pool, project_id).await?;
        self.cancel_items(user_id, ids).await
    }

    pub async fn cancel_all(&self, user_id: UserId) -> AppResult<CancelResult> {
        let ids = QueueItemStore::queued_ids_for_user(&self.pool, user_id).await?;
        self.cancel_items(user_id, ids).await
    }

    async fn emit_cancellation_events(&self, user_id: UserId, cancelled: &[(QueueItemId, ImageId)]) {
        use seg_core::events::SegmentationUpdateEvent;

        let mut affected_projects = std::collections::HashSet::new();
        for &(_, image_id) in cancelled {
            let envelope = Envelope::new(
                event_names::SEGMENTATION_UPDATE,
                SegmentationUpdateEvent { image_id, status: "none".into() },
            );
            self.bus.publish(Room::User(user_id), envelope).await;
        }
        for &(item_id, _) in cancelled {
            if let Ok(item) = seg_store::QueueItemStore::get(&self.pool, item_id).await {
                affected_projects.insert(item.project_id);
            }
        }
        for project_id in affected_projects {
            if let Ok((queued, processing)) = QueueItemStore::stats_for_project(&self.pool, project_id).await {
                let envelope = Envelope::new(
                    event_names::QUEUE_STATS,
                    seg_core::events::QueueStatsEvent {
                        project_id,
                        queued: queued as u32,
                        processing: processing as u32,
                    },
                );
                self.bus.publish(Room::Project(project_id), envelope).await;
            }
        }
    }

    pub async fn stats_for_project(&self, project_id: ProjectId) -> AppResult<(i64, i64)> {
        QueueItemStore::stats_for_project(&self.pool, project_id).await
    }
}

/// Marks any item left `processing` from a prior process as `Interrupted`
/// (§7), to be run once at startup before the dispatcher loop begins.
pub async fn recover_interrupted(pool: &PgPool) -> AppResult<()> {
    let count = seg_store::QueueItemStore::fail_interrupted(pool).await?;
    if count > 0 {
        warn!(count, "recovered interrupted queue items on startup");
    } else {
        info!("no interrupted queue items to recover");
    }
    Ok(())
}
