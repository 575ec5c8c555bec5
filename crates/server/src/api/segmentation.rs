//! Segmentation queue endpoints: batch enqueue and cancellation over the
//! `QueueEngine` contract. `seg_core::AppError` already implements
//! `IntoResponse` with a closed status-code mapping, so handlers return
//! `AppResult<T>` directly rather than threading their own response
//! conversion helpers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use seg_core::{AppError, AppResult, ImageId, ProjectId, QueueItemId};
use seg_stats::{MutationOp, NotifyKey};
use seg_store::{ProjectStore, QueueItemStore};

use crate::auth::CurrentUser;
use crate::state::AppState;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueBatchRequest {
    #[schema(value_type = Vec<uuid::Uuid>)]
    pub image_ids: Vec<ImageId>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default)]
    pub detect_holes: bool,
}

fn default_model() -> String {
    "default".to_string()
}
fn default_threshold() -> f32 {
    0.5
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EnqueueBatchResponse {
    pub batch_id: uuid::Uuid,
    #[schema(value_type = Vec<uuid::Uuid>)]
    pub item_ids: Vec<QueueItemId>,
}

#[utoipa::path(
    post,
    path = "/projects/{project_id}/segmentation/batch",
    tag = "Segmentation",
    params(("project_id" = uuid::Uuid, Path, description = "Project ID")),
    request_body = EnqueueBatchRequest,
    responses(
        (status = 202, description = "Batch enqueued", body = EnqueueBatchResponse)
    )
)]
pub async fn enqueue_batch(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(project_id): Path<ProjectId>,
    Json(req): Json<EnqueueBatchRequest>,
) -> AppResult<(StatusCode, Json<EnqueueBatchResponse>)> {
    if !ProjectStore::user_can_access(&state.pool, project_id, user_id).await? {
        return Err(AppError::Forbidden);
    }
    let result = state
        .queue
        .enqueue(user_id, project_id, req.image_ids, req.model, req.threshold, req.detect_holes)
        .await?;
    state.stats.notify(NotifyKey::Project(project_id), MutationOp::Enqueue);
    state.stats.notify(NotifyKey::User(user_id), MutationOp::Enqueue);
    Ok((StatusCode::ACCEPTED, Json(EnqueueBatchResponse { batch_id: result.batch_id, item_ids: result.item_ids })))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CancelResponse {
    #[schema(value_type = Vec<uuid::Uuid>)]
    pub cancelled: Vec<QueueItemId>,
    #[schema(value_type = Vec<uuid::Uuid>)]
    pub skipped: Vec<QueueItemId>,
}

/// DELETE /queue/items/{id}. 200 if fully cancelled, 409 if the only
/// item named was already past `queued` (§6 status-code table).
pub async fn cancel_item(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<QueueItemId>,
) -> AppResult<(StatusCode, Json<CancelResponse>)> {
    let item = QueueItemStore::get(&state.pool, id).await?;
    if !ProjectStore::user_can_access(&state.pool, item.project_id, user_id).await? {
        return Err(AppError::Forbidden);
    }
    let result = state.queue.cancel_items(user_id, vec![id]).await?;
    state.stats.notify(NotifyKey::User(user_id), MutationOp::Deletion);
    let status = if result.cancelled.is_empty() { StatusCode::CONFLICT } else { StatusCode::OK };
    Ok((status, Json(CancelResponse { cancelled: result.cancelled, skipped: result.skipped })))
}

/// DELETE /projects/{p}/queue. 207 when some items were already
/// `processing` and therefore skipped (§6 "used to indicate
/// partial success").
pub async fn cancel_project_queue(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(project_id): Path<ProjectId>,
) -> AppResult<(StatusCode, Json<CancelResponse>)> {
    if !ProjectStore::user_can_access(&state.pool, project_id, user_id).await? {
        return Err(AppError::Forbidden);
    }
    let result = state.queue.cancel_project(user_id, project_id).await?;
    state.stats.notify(NotifyKey::Project(project_id), MutationOp::Deletion);
    state.stats.notify(NotifyKey::User(user_id), MutationOp::Deletion);
    let status = if result.skipped.is_empty() { StatusCode::OK } else { StatusCode::from_u16(207).unwrap() };
    Ok((status, Json(CancelResponse { cancelled: result.cancelled, skipped: result.skipped })))
}
