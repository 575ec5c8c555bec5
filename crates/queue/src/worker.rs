//! Per-item execution pipeline (§4.2 "Execution"). Grounded on
//! `ingestion/job_runner.rs`'s `run_ingestion_job`: status transitions
//! guarded by a conditional write, a progress-forwarding task, and
//! `publish_event` calls with a bounded timeout — reused here almost
//! line-for-line in control flow.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use seg_bus::EventBus;
use seg_core::events::{
    event_names, Envelope, Room, SegmentationCompletedEvent, SegmentationFailedEvent,
    SegmentationProgressEvent, SegmentationUpdateEvent,
};
use seg_core::AppError;
use seg_inference::{InferenceClient, InferenceError, InferenceRequest};
use seg_render::{RenderEngine, RenderOptions, RenderPolygon, RgbColor};
use seg_stats::{MutationOp, NotifyKey, StatsAggregator};
use seg_store::entities::{Polygon, QueueItem};
use seg_store::{ImageStore, QueueItemStore, SegmentationStore};

const RETRY_BACKOFFS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(4)];

/// Runs one claimed item through inference to a terminal state. Never
/// panics on business failure — all error paths end in a conditional
/// store write, matching §8 invariant 1 ("no resurrection").
#[allow(clippy::too_many_arguments)]
pub async fn run_claimed_item(
    pool: &PgPool,
    bus: &EventBus,
    inference: &dyn InferenceClient,
    render: &RenderEngine,
    stats: &Arc<StatsAggregator>,
    upload_dir: &str,
    item: QueueItem,
    retry_budget: u32,
    timeout: Duration,
) {
    bus.publish(
        Room::User(item.user_id),
        Envelope::new(
            event_names::SEGMENTATION_UPDATE,
            SegmentationUpdateEvent { image_id: item.image_id, status: "processing".into() },
        ),
    )
    .await;

    let mut attempt = 0u32;
    let outcome = loop {
        let result = run_inference_with_progress(pool, bus, inference, &item, timeout).await;
        match &result {
            Err(e) if is_retryable(e) && attempt < retry_budget => {
                warn!(
                    queue_item_id = %item.id,
                    attempt,
                    error = %e,
                    "transient inference failure, retrying"
                );
                tokio::time::sleep(RETRY_BACKOFFS[attempt as usize % RETRY_BACKOFFS.len()]).await;
                attempt += 1;
                continue;
            }
            _ => break result,
        }
    };

    match outcome {
        Ok((polygons, duration_ms)) => {
            complete_item(pool, bus, render, stats, upload_dir, &item, polygons, duration_ms).await
        }
        Err(e) => fail_item(pool, bus, stats, &item, &e, attempt).await,
    }
}

async fn run_inference_with_progress(
    pool: &PgPool,
    bus: &EventBus,
    inference: &dyn InferenceClient,
    item: &QueueItem,
    timeout: Duration,
) -> Result<(Vec<Polygon>, i64), InferenceError> {
    let image = ImageStore::get(pool, item.image_id)
        .await
        .map_err(|e| InferenceError::Internal(e.to_string()))?;

    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let request = InferenceRequest {
        model: item.model.clone(),
        image_path: image.original_path.clone(),
        threshold: item.threshold,
        detect_holes: item.detect_holes,
    };

    let started = tokio::time::Instant::now();
    let run_fut = inference.run(request, tx, CancellationToken::new());
    tokio::pin!(run_fut);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let result = loop {
        tokio::select! {
            biased;
            progress = rx.recv() => {
                match progress {
                    Some(p) => {
                        let event = Envelope::new(
                            event_names::SEGMENTATION_PROGRESS,
                            SegmentationProgressEvent {
                                image_id: item.image_id,
                                queue_item_id: item.id,
                                stage: p.stage.as_str().to_string(),
                                progress: p.progress,
                            },
                        );
                        bus.publish(Room::User(item.user_id), event).await;
                    }
                    None => continue,
                }
            }
            res = &mut run_fut => break res,
            _ = &mut deadline => break Err(InferenceError::TimedOut),
        }
    };

    let elapsed_ms = started.elapsed().as_millis() as i64;
    result.map(|r| {
        let polygons = r.polygons.into_iter().map(|p| Polygon { points: p.points, is_internal: p.is_internal }).collect();
        (polygons, elapsed_ms)
    })
}

fn is_retryable(err: &InferenceError) -> bool {
    matches!(err, InferenceError::Transient(_) | InferenceError::TimedOut)
}

async fn complete_item(
    pool: &PgPool,
    bus: &EventBus,
    render: &RenderEngine,
    stats: &Arc<StatsAggregator>,
    upload_dir: &str,
    item: &QueueItem,
    polygons: Vec<Polygon>,
    duration_ms: i64,
) {
    let transitioned = match QueueItemStore::transition_if(pool, item.id, "processing", "completed").await {
        Ok(t) => t,
        Err(e) => {
            warn!(queue_item_id = %item.id, error = %e, "failed to transition queue item to completed");
            return;
        }
    };
    if !transitioned {
        info!(queue_item_id = %item.id, "completion arrived for non-processing item, dropped (cancellation race)");
        return;
    }

    if let Err(e) =
        SegmentationStore::replace(pool, item.image_id, &polygons, &item.model, item.threshold, duration_ms).await
    {
        warn!(queue_item_id = %item.id, error = %e, "failed to persist segmentation after successful inference");
        return;
    }

    let thumbnail_path = format!("{}/segmentation-thumbnails/{}.png", upload_dir.trim_end_matches('/'), item.image_id);
    if let Err(e) = ImageStore::mark_segmented(pool, item.image_id, &thumbnail_path).await {
        warn!(image_id = %item.image_id, error = %e, "failed to mark image segmented");
    }
    render_segmentation_thumbnail(pool, render, item.image_id, &polygons, &thumbnail_path).await;

    bus.publish(
        Room::User(item.user_id),
        Envelope::new(
            event_names::SEGMENTATION_COMPLETED,
            SegmentationCompletedEvent {
                image_id: item.image_id,
                queue_item_id: item.id,
                duration_ms: duration_ms.max(0) as u64,
            },
        ),
    )
    .await;

    if let Ok((queued, processing)) = QueueItemStore::stats_for_project(pool, item.project_id).await {
        bus.publish(
            Room::Project(item.project_id),
            Envelope::new(
                event_names::QUEUE_STATS,
                seg_core::events::QueueStatsEvent {
                    project_id: item.project_id,
                    queued: queued as u32,
                    processing: processing as u32,
                },
            ),
        )
        .await;
    }

    stats.notify(NotifyKey::Project(item.project_id), MutationOp::Completion);
    stats.notify(NotifyKey::User(item.user_id), MutationOp::Completion);
}

/// Rasterizes the segmentation thumbnail at the path already persisted on
/// the Image row. Runs inline rather than as a truly detached task since
/// the worker holds the only reference to `render`; failures are logged
/// and never block the `Completed` event (§4.2 step 3).
async fn render_segmentation_thumbnail(
    pool: &PgPool,
    render: &RenderEngine,
    image_id: seg_core::ImageId,
    polygons: &[Polygon],
    thumbnail_path: &str,
) {
    let image = match ImageStore::get(pool, image_id).await {
        Ok(i) => i,
        Err(e) => {
            warn!(%image_id, error = %e, "failed to load image for thumbnail render");
            return;
        }
    };

    let render_polygons: Vec<RenderPolygon> = polygons
        .iter()
        .enumerate()
        .map(|(i, p)| RenderPolygon {
            points: p.points.clone(),
            is_internal: p.is_internal,
            label: (!p.is_internal).then_some(i as u32 + 1),
        })
        .collect();

    let options = RenderOptions {
        show_numbers: true,
        external_color: RgbColor::from_hex("#FF0000"),
        internal_color: RgbColor::from_hex("#0000FF"),
        stroke_width: 2,
        font_size: 16,
        transparency: 0.3,
    };

    let output = std::path::PathBuf::from(thumbnail_path);
    if let Some(parent) = output.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(%image_id, error = %e, "failed to create thumbnail directory");
            return;
        }
    }

    let source = std::path::PathBuf::from(&image.original_path);
    if let Err(e) = render.render_thumbnail(&source, &render_polygons, &options, 512, &output) {
        warn!(%image_id, error = %e, "failed to render segmentation thumbnail");
    }
}

async fn fail_item(
    pool: &PgPool,
    bus: &EventBus,
    stats: &Arc<StatsAggregator>,
    item: &QueueItem,
    err: &InferenceError,
    retries_used: u32,
) {
    let app_err: AppError = match err {
        InferenceError::InvalidInput(m) => AppError::InvalidInput(m.clone()),
        InferenceError::Transient(m) => AppError::Transient(m.clone()),
        InferenceError::TimedOut => AppError::Transient("inference timed out".into()),
        InferenceError::Internal(m) => AppError::Internal(m.clone()),
    };

    let transitioned = match QueueItemStore::record_failure(
        pool,
        item.id,
        "processing",
        app_err.code(),
        &app_err.to_string(),
        retries_used as i32,
    )
    .await
    {
        Ok(t) => t,
        Err(e) => {
            warn!(queue_item_id = %item.id, error = %e, "failed to record queue item failure");
            return;
        }
    };
    if !transitioned {
        info!(queue_item_id = %item.id, "failure arrived for non-processing item, dropped (cancellation race)");
        return;
    }

    if let Err(e) = ImageStore::mark_failed(pool, item.image_id).await {
        warn!(image_id = %item.image_id, error = %e, "failed to mark image failed");
    }

    bus.publish(
        Room::User(item.user_id),
        Envelope::new(
            event_names::SEGMENTATION_FAILED,
            SegmentationFailedEvent {
                image_id: item.image_id,
                queue_item_id: item.id,
                code: app_err.code().to_string(),
                message: app_err.to_string(),
                retryable: app_err.retryable(),
            },
        ),
    )
    .await;

    stats.notify(NotifyKey::Project(item.project_id), MutationOp::Completion);
    stats.notify(NotifyKey::User(item.user_id), MutationOp::Completion);
}
