//! HTTP router construction.
//!
//! Assembles all Axum routes, middleware, and OpenAPI docs into a single `Router`.

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::state::AppState;
use crate::{api, ws};

/// Build the complete application router with all routes and middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    let app = Router::new()
        .route("/health", get(api::health::health))
        .route(
            "/projects/{project_id}/segmentation/batch",
            post(api::segmentation::enqueue_batch),
        )
        .route("/queue/items/{id}", delete(api::segmentation::cancel_item))
        .route(
            "/projects/{project_id}/queue",
            delete(api::segmentation::cancel_project_queue),
        )
        .route("/projects/{project_id}/export", post(api::export::start_export))
        .route(
            "/projects/{project_id}/export/{job_id}/status",
            get(api::export::export_status),
        )
        .route(
            "/projects/{project_id}/export/{job_id}/cancel",
            post(api::export::cancel_export),
        )
        .route(
            "/projects/{project_id}/export/{job_id}/download",
            get(api::export::download_export),
        )
        .route("/projects/{project_id}/stats", get(api::stats::project_stats))
        .route("/dashboard/metrics", get(api::stats::dashboard_metrics))
        .route("/ws", get(ws::ws_upgrade));

    app.layer(CorsLayer::permissive())
        .with_state(state)
        .merge(Scalar::with_url("/docs", api::doc::ApiDoc::openapi()))
}
