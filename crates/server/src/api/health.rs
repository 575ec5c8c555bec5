//! Liveness/readiness endpoint. Grounded on `api/health.rs`'s `health`
//! handler shape.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthBody {
    status: &'static str,
    database_connected: bool,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthBody> {
    let database_connected = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    Json(HealthBody { status: "ok", database_connected })
}
