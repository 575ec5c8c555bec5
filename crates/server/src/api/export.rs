//! Export job endpoints (§6 REST table, §4.3 `ExportEngine`
//! contract). Download streams the archive from disk rather than
//! loading it into memory, matching the archive-on-disk design of
//! `seg_export::ExportEngine::download_path`.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use utoipa::ToSchema;

use seg_core::{AppError, AppResult, ExportJobId, ProjectId};
use seg_store::entities::ExportOptions;

use crate::auth::CurrentUser;
use crate::state::AppState;

#[derive(serde::Serialize, ToSchema)]
pub struct StartExportResponse {
    #[schema(value_type = uuid::Uuid)]
    pub job_id: ExportJobId,
}

#[utoipa::path(
    post,
    path = "/projects/{project_id}/export",
    tag = "Export",
    params(("project_id" = uuid::Uuid, Path, description = "Project ID")),
    request_body(content = Object, description = "Export options: image selection, annotation/visualization/metrics formats"),
    responses(
        (status = 202, description = "Export job started", body = StartExportResponse)
    )
)]
pub async fn start_export(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(project_id): Path<ProjectId>,
    Json(options): Json<ExportOptions>,
) -> AppResult<(StatusCode, Json<StartExportResponse>)> {
    let job_id = state.export.start(user_id, project_id, options).await?;
    Ok((StatusCode::ACCEPTED, Json(StartExportResponse { job_id })))
}

#[utoipa::path(
    get,
    path = "/projects/{project_id}/export/{job_id}/status",
    tag = "Export",
    params(
        ("project_id" = uuid::Uuid, Path, description = "Project ID"),
        ("job_id" = uuid::Uuid, Path, description = "Export job ID"),
    ),
    responses(
        (status = 200, description = "Export job status", body = Object)
    )
)]
pub async fn export_status(
    State(state): State<Arc<AppState>>,
    CurrentUser(_user_id): CurrentUser,
    Path((_project_id, job_id)): Path<(ProjectId, ExportJobId)>,
) -> AppResult<Json<seg_store::entities::ExportJob>> {
    Ok(Json(state.export.status(job_id).await?))
}

#[utoipa::path(
    post,
    path = "/projects/{project_id}/export/{job_id}/cancel",
    tag = "Export",
    params(
        ("project_id" = uuid::Uuid, Path, description = "Project ID"),
        ("job_id" = uuid::Uuid, Path, description = "Export job ID"),
    ),
    responses(
        (status = 200, description = "Export job cancelled (idempotent)")
    )
)]
/// Idempotent: repeated calls on an already-cancelled job still return
/// 200 (§8 property 5).
pub async fn cancel_export(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path((_project_id, job_id)): Path<(ProjectId, ExportJobId)>,
) -> AppResult<StatusCode> {
    state.reconciler.with_lock(seg_reconciler::JobKind::ExportJob(job_id), || state.export.cancel(user_id, job_id)).await?;
    Ok(StatusCode::OK)
}

/// GET /projects/{p}/export/{job}/download. 409 if the job has not
/// reached `completed` (§8 property 6 "artifact gating"). Consults the
/// Reconciler's view of the job status rather than racing a concurrent
/// cancel directly against the store.
pub async fn download_export(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path((_project_id, job_id)): Path<(ProjectId, ExportJobId)>,
) -> AppResult<impl IntoResponse> {
    let status = state
        .reconciler
        .with_lock(seg_reconciler::JobKind::ExportJob(job_id), || {
            state.reconciler.last_known_export_status(&state.pool, job_id)
        })
        .await?;
    if status != "completed" {
        return Err(AppError::Conflict(format!("export job {job_id} is not completed")));
    }
    let path = state.export.download_path(user_id, job_id).await?;
    let file = File::open(&path).await.map_err(|e| AppError::Internal(format!("failed to open export archive: {e}")))?;
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);
    let file_name = format!("export-{job_id}.zip");
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{file_name}\"")),
        ],
        body,
    ))
}
