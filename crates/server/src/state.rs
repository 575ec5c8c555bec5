//! Composition-root state shared by every handler. Grounded on
//! `state.rs`'s `AppState`: one struct of `Arc`-wrapped engine handles
//! built once at startup and cloned cheaply per request via
//! `State<Arc<AppState>>`.

use std::sync::Arc;

use sqlx::PgPool;

use seg_bus::EventBus;
use seg_core::Config;
use seg_export::ExportEngine;
use seg_queue::QueueEngine;
use seg_reconciler::Reconciler;
use seg_render::RenderEngine;
use seg_stats::StatsAggregator;

pub struct AppState {
    pub pool: PgPool,
    pub bus: Arc<EventBus>,
    pub queue: QueueEngine,
    pub export: Arc<ExportEngine>,
    pub reconciler: Arc<Reconciler>,
    pub stats: Arc<StatsAggregator>,
    pub render: Arc<RenderEngine>,
    pub config: Config,
}
