//! Composition root: wires every engine into a shared `AppState` and
//! spawns the long-running background tasks. Grounded on `main.rs`'s
//! `serve()` (construct shared state, build router, bind, spawn
//! background workers, then `axum::serve`).

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use seg_bus::EventBus;
use seg_core::Config;
use seg_export::ExportEngine;
use seg_inference::{HttpInferenceClient, InferenceClient};
use seg_queue::QueueEngine;
use seg_reconciler::Reconciler;
use seg_render::RenderEngine;
use seg_stats::StatsAggregator;

use crate::state::AppState;
use crate::{background, db, router};

/// Connects to postgres, runs startup recovery, wires the engines, and
/// returns the router ready to be served.
pub async fn build(config: Config) -> anyhow::Result<axum::Router> {
    let store = db::connect(&config).await?;
    let pool = store.pg().clone();

    seg_queue::recover_interrupted(&pool).await?;
    seg_export::recover_interrupted(&pool).await?;

    let bus = Arc::new(EventBus::new());
    let render = Arc::new(RenderEngine::new());
    let inference: Arc<dyn InferenceClient> =
        Arc::new(HttpInferenceClient::new(config.ml_service_url.clone(), Duration::from_secs(config.queue.inference_timeout_secs)));
    let queue = QueueEngine::new(pool.clone(), bus.clone());
    let export = ExportEngine::new(pool.clone(), bus.clone(), render.clone(), config.upload_dir.clone(), config.export.clone());
    let reconciler = Arc::new(Reconciler::new());
    let stats = StatsAggregator::new(pool.clone(), bus.clone());

    tokio::spawn(seg_queue::run_dispatcher_loop(
        pool.clone(),
        bus.clone(),
        inference,
        render.clone(),
        stats.clone(),
        config.clone(),
    ));

    let state = Arc::new(AppState { pool: pool.clone(), bus: bus.clone(), queue, export: export.clone(), reconciler, stats, render, config: config.clone() });

    tokio::spawn(background::run_retention_sweep(pool.clone(), config.queue.retention_days));
    tokio::spawn(background::run_temp_dir_sweep(pool, config.upload_dir.clone()));

    info!("engines wired, background tasks spawned");

    Ok(router::build_router(state))
}
