//! StatsAggregator read endpoints (§4.7). Not named in §6's
//! representative table, but `projectStats`/`dashboardMetrics` are
//! public operations on the component and need a caller-reachable path.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;

use seg_core::{AppError, AppResult, ProjectId};
use seg_stats::{DashboardMetrics, ProjectStats};
use seg_store::ProjectStore;

use crate::auth::CurrentUser;
use crate::state::AppState;

/// GET /projects/{p}/stats
pub async fn project_stats(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(project_id): Path<ProjectId>,
) -> AppResult<Json<ProjectStats>> {
    if !ProjectStore::user_can_access(&state.pool, project_id, user_id).await? {
        return Err(AppError::Forbidden);
    }
    Ok(Json(state.stats.project_stats(project_id).await?))
}

/// GET /dashboard/metrics
pub async fn dashboard_metrics(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
) -> AppResult<Json<DashboardMetrics>> {
    Ok(Json(state.stats.dashboard_metrics(user_id).await?))
}
