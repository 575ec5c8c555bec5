//! Export Job Engine: `start` creates the job row and spawns the worker
//! task immediately; the worker runs a six-phase sequential pipeline,
//! with per-phase parallelism bounded by a `Semaphore`.

mod annotations;
mod archive;
mod metrics;
mod pipeline;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use seg_bus::EventBus;
use seg_core::config::ExportConfig;
use seg_core::events::{event_names, Envelope, ExportProgressEvent, ExportTerminalEvent, Room};
use seg_core::{AppError, AppResult, ExportJobId, ProjectId, UserId};
use seg_store::entities::{AnnotationFormat, ExportJob, ExportOptions, ExportPhase};
use seg_store::{ExportJobStore, ImageStore, ProjectStore, SegmentationStore};

use annotations::AnnotatedImage;
use pipeline::{overall_progress, ProgressThrottle};

pub struct ExportEngine {
    pool: PgPool,
    bus: Arc<EventBus>,
    render: Arc<seg_render::RenderEngine>,
    upload_dir: String,
    config: ExportConfig,
    worker_permits: Arc<Semaphore>,
}

impl ExportEngine {
    pub fn new(
        pool: PgPool,
        bus: Arc<EventBus>,
        render: Arc<seg_render::RenderEngine>,
        upload_dir: String,
        config: ExportConfig,
    ) -> Arc<Self> {
        let worker_permits = Arc::new(Semaphore::new(config.worker_pool_size as usize));
        Arc::new(Self { pool, bus, render, upload_dir, config, worker_permits })
    }

    fn working_dir(&self, job_id: ExportJobId) -> PathBuf {
        Path::new(&self.upload_dir).join("exports").join(job_id.as_uuid().to_string())
    }

    fn archive_path(&self, job_id: ExportJobId) -> PathBuf {
        Path::new(&self.upload_dir).join("exports").join(format!("{}.zip", job_id.as_uuid()))
    }

    /// §4.3 `start`: validates ownership and options, creates the job
    /// `pending`, and returns immediately — the pipeline itself runs on
    /// a spawned task bounded by the worker pool semaphore.
    pub async fn start(self: &Arc<Self>, user_id: UserId, project_id: ProjectId, options: ExportOptions) -> AppResult<ExportJobId> {
        if !ProjectStore::user_can_access(&self.pool, project_id, user_id).await? {
            return Err(AppError::Forbidden);
        }
        options.validate()?;

        let raw_options: Value = serde_json::to_value(&options).map_err(|e| AppError::Internal(e.to_string()))?;
        let job_id = ExportJobStore::create(&self.pool, project_id, user_id, raw_options).await?;

        self.bus
            .publish(
                Room::Export(job_id),
                Envelope::new(event_names::EXPORT_STARTED, ExportTerminalEvent { job_id, code: None, message: None }),
            )
            .await;

        let engine = self.clone();
        tokio::spawn(async move {
            let _permit = engine.worker_permits.clone().acquire_owned().await;
            engine.run_job(job_id, project_id, options).await;
        });

        Ok(job_id)
    }

    /// §4.3 `cancel`: idempotent, transitions regardless of phase. The
    /// running task observes the store transition at its next
    /// cancellation check and tears down partial output itself.
    pub async fn cancel(&self, user_id: UserId, job_id: ExportJobId) -> AppResult<()> {
        let job = ExportJobStore::get(&self.pool, job_id).await?;
        if job.user_id != user_id {
            return Err(AppError::Forbidden);
        }
        let transitioned = ExportJobStore::cancel(&self.pool, job_id).await?;
        if transitioned {
            self.bus
                .publish(
                    Room::Export(job_id),
                    Envelope::new(event_names::EXPORT_CANCELLED, ExportTerminalEvent { job_id, code: None, message: None }),
                )
                .await;
        }
        Ok(())
    }

    pub async fn status(&self, job_id: ExportJobId) -> AppResult<ExportJob> {
        ExportJobStore::get(&self.pool, job_id).await
    }

    /// §4.3 `download`: resolves the artifact path if the job is
    /// `completed` and the caller has project access.
    pub async fn download_path(&self, user_id: UserId, job_id: ExportJobId) -> AppResult<String> {
        let job = ExportJobStore::get(&self.pool, job_id).await?;
        if !ProjectStore::user_can_access(&self.pool, job.project_id, user_id).await? {
            return Err(AppError::Forbidden);
        }
        if job.status != "completed" {
            return Err(AppError::Conflict(format!("export job {job_id} is not completed")));
        }
        job.artifact_path.ok_or_else(|| AppError::Internal(format!("completed export job {job_id} has no artifact path")))
    }

    async fn run_job(&self, job_id: ExportJobId, project_id: ProjectId, options: ExportOptions) {
        let working_dir = self.working_dir(job_id);
        if let Err(e) = tokio::fs::create_dir_all(&working_dir).await {
            self.fail(job_id, &format!("failed to create export working directory: {e}")).await;
            return;
        }

        let all_images = match ImageStore::list_for_project(&self.pool, project_id).await {
            Ok(images) => images,
            Err(e) => {
                self.fail(job_id, &e.to_string()).await;
                self.cleanup(&working_dir).await;
                return;
            }
        };
        let images: Vec<_> = if options.selected_image_ids.is_empty() {
            all_images
        } else {
            all_images.into_iter().filter(|i| options.selected_image_ids.contains(&i.id)).collect()
        };

        if self.check_cancelled(job_id, &working_dir).await {
            return;
        }

        if options.include_original_images && self.run_images_phase(job_id, &working_dir, &images).await.is_break() {
            return;
        }

        let mut render_failures = 0usize;
        if options.include_visualizations {
            match self.run_visualizations_phase(job_id, &working_dir, &images, &options).await {
                PhaseOutcome::Cancelled => return,
                PhaseOutcome::FailureCount(n) => render_failures = n,
                PhaseOutcome::Ok => {}
            }
            if !images.is_empty() && render_failures * 2 >= images.len() {
                self.fail(job_id, "more than half of the images failed to render").await;
                self.cleanup(&working_dir).await;
                return;
            }
        }

        let annotated = match self.load_annotated_images(&images).await {
            Ok(a) => a,
            Err(e) => {
                self.fail(job_id, &e.to_string()).await;
                self.cleanup(&working_dir).await;
                return;
            }
        };

        if self.run_annotations_phase(job_id, &working_dir, &annotated, &options).await.is_break() {
            return;
        }

        if self.run_metrics_phase(job_id, &working_dir, &annotated, &options).await.is_break() {
            return;
        }

        if options.include_documentation {
            let _ = tokio::fs::write(
                working_dir.join("README.txt"),
                "Generated export archive. See annotations/ and metrics/ for per-image data.",
            )
            .await;
        }

        self.run_compression_phase(job_id, &working_dir).await;
    }

    async fn check_cancelled(&self, job_id: ExportJobId, working_dir: &Path) -> bool {
        match ExportJobStore::is_cancelled(&self.pool, job_id).await {
            Ok(true) => {
                self.cleanup(working_dir).await;
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(%job_id, error = %e, "failed to check export job cancellation");
                false
            }
        }
    }

    async fn emit_progress(&self, job_id: ExportJobId, phase: ExportPhase, stage_progress: f32) {
        let progress = overall_progress(phase, stage_progress);
        let _ = ExportJobStore::set_phase_progress(&self.pool, job_id, phase.as_str(), progress * 100.0).await;
        self.bus
            .publish(
                Room::Export(job_id),
                Envelope::new(
                    event_names::EXPORT_PROGRESS,
                    ExportProgressEvent {
                        job_id,
                        phase: phase.as_str().to_string(),
                        progress: progress * 100.0,
                        stage: None,
                        stage_progress: Some(stage_progress * 100.0),
                    },
                ),
            )
            .await;
    }

    async fn run_images_phase(&self, job_id: ExportJobId, working_dir: &Path, images: &[seg_store::entities::Image]) -> ControlFlow {
        let dest_dir = working_dir.join("images");
        if let Err(e) = tokio::fs::create_dir_all(&dest_dir).await {
            self.fail(job_id, &e.to_string()).await;
            self.cleanup(working_dir).await;
            return ControlFlow::Break;
        }

        let mut throttle = ProgressThrottle::default();
        let total = images.len().max(1);
        for (i, image) in images.iter().enumerate() {
            if self.check_cancelled(job_id, working_dir).await {
                return ControlFlow::Break;
            }
            let source = PathBuf::from(&image.original_path);
            let file_name = source.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| format!("{}.bin", image.id));
            if let Err(e) = tokio::fs::copy(&source, dest_dir.join(&file_name)).await {
                warn!(image_id = %image.id, error = %e, "failed to copy original image into export working dir");
            }
            if throttle.should_emit((i + 1) as f32 / total as f32) {
                self.emit_progress(job_id, ExportPhase::Images, (i + 1) as f32 / total as f32).await;
            }
        }
        ControlFlow::Continue
    }

    async fn run_visualizations_phase(
        &self,
        job_id: ExportJobId,
        working_dir: &Path,
        images: &[seg_store::entities::Image],
        options: &ExportOptions,
    ) -> PhaseOutcome {
        let dest_dir = working_dir.join("visualizations");
        if let Err(e) = tokio::fs::create_dir_all(&dest_dir).await {
            self.fail(job_id, &e.to_string()).await;
            self.cleanup(working_dir).await;
            return PhaseOutcome::Cancelled;
        }
        if self.check_cancelled(job_id, working_dir).await {
            return PhaseOutcome::Cancelled;
        }

        let render_options = seg_render::RenderOptions {
            show_numbers: options.visualization_options.show_numbers,
            external_color: seg_render::RgbColor::from_hex(&options.visualization_options.polygon_colors.external),
            internal_color: seg_render::RgbColor::from_hex(&options.visualization_options.polygon_colors.internal),
            stroke_width: options.visualization_options.stroke_width,
            font_size: options.visualization_options.font_size,
            transparency: options.visualization_options.transparency,
        };

        let fan_out = self.config.fan_out.max(1) as usize;
        let total = images.len().max(1);
        let failures = std::sync::atomic::AtomicUsize::new(0);
        let processed = std::sync::atomic::AtomicUsize::new(0);

        let jobs = stream::iter(images.to_vec()).map(|image| {
            let pool = self.pool.clone();
            let render = self.render.clone();
            let dest_dir = dest_dir.clone();
            let render_options = render_options.clone();
            let image_id = image.id;
            let original_path = image.original_path.clone();
            async move {
                let segmentation = match SegmentationStore::get_for_image(&pool, image_id).await {
                    Ok(s) => s,
                    Err(_) => return false,
                };
                let Some(segmentation) = segmentation else { return true };
                let polygons: Vec<seg_render::RenderPolygon> = segmentation
                    .polygons_typed()
                    .into_iter()
                    .enumerate()
                    .map(|(i, p)| seg_render::RenderPolygon { points: p.points, is_internal: p.is_internal, label: (!p.is_internal).then_some(i as u32 + 1) })
                    .collect();
                let source = PathBuf::from(&original_path);
                let file_name = source.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| format!("{}.png", image_id));
                let output = dest_dir.join(&file_name);
                render.render_overlay(&source, &polygons, &render_options, &output).is_ok()
            }
        });

        let mut results = jobs.buffer_unordered(fan_out);
        let mut throttle = ProgressThrottle::default();
        while let Some(ok) = results.next().await {
            if !ok {
                failures.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
            let done = processed.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if throttle.should_emit(done as f32 / total as f32) {
                self.emit_progress(job_id, ExportPhase::Visualizations, done as f32 / total as f32).await;
            }
            if self.check_cancelled(job_id, working_dir).await {
                return PhaseOutcome::Cancelled;
            }
        }

        PhaseOutcome::FailureCount(failures.load(std::sync::atomic::Ordering::SeqCst))
    }

    async fn load_annotated_images(&self, images: &[seg_store::entities::Image]) -> AppResult<Vec<AnnotatedImage>> {
        let mut out = Vec::with_capacity(images.len());
        for image in images {
            let polygons = match SegmentationStore::get_for_image(&self.pool, image.id).await? {
                Some(segmentation) => segmentation.polygons_typed(),
                None => Vec::new(),
            };
            let (width, height) = image::image_dimensions(&image.original_path).unwrap_or((0, 0));
            let file_name = PathBuf::from(&image.original_path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| format!("{}.png", image.id));
            out.push(AnnotatedImage { image_id: image.id, file_name, width, height, polygons });
        }
        Ok(out)
    }

    async fn run_annotations_phase(&self, job_id: ExportJobId, working_dir: &Path, images: &[AnnotatedImage], options: &ExportOptions) -> ControlFlow {
        if options.annotation_formats.is_empty() {
            self.emit_progress(job_id, ExportPhase::Annotations, 1.0).await;
            return ControlFlow::Continue;
        }
        let dest_dir = working_dir.join("annotations");
        if let Err(e) = tokio::fs::create_dir_all(&dest_dir).await {
            self.fail(job_id, &e.to_string()).await;
            self.cleanup(working_dir).await;
            return ControlFlow::Break;
        }
        if self.check_cancelled(job_id, working_dir).await {
            return ControlFlow::Break;
        }

        let total = options.annotation_formats.len().max(1);
        for (i, format) in options.annotation_formats.iter().enumerate() {
            if self.check_cancelled(job_id, working_dir).await {
                return ControlFlow::Break;
            }
            let result = match format {
                AnnotationFormat::Coco => annotations::write_coco(images, &dest_dir.join("coco.json")),
                AnnotationFormat::Yolo => annotations::write_yolo(images, &dest_dir.join("yolo")),
                AnnotationFormat::Json => annotations::write_native_json(images, &dest_dir.join("annotations.json")),
            };
            if let Err(e) = result {
                self.fail(job_id, &e.to_string()).await;
                self.cleanup(working_dir).await;
                return ControlFlow::Break;
            }
            self.emit_progress(job_id, ExportPhase::Annotations, (i + 1) as f32 / total as f32).await;
        }
        ControlFlow::Continue
    }

    async fn run_metrics_phase(&self, job_id: ExportJobId, working_dir: &Path, images: &[AnnotatedImage], options: &ExportOptions) -> ControlFlow {
        if options.metrics_formats.is_empty() {
            self.emit_progress(job_id, ExportPhase::Metrics, 1.0).await;
            return ControlFlow::Continue;
        }
        let dest_dir = working_dir.join("metrics");
        if let Err(e) = tokio::fs::create_dir_all(&dest_dir).await {
            self.fail(job_id, &e.to_string()).await;
            self.cleanup(working_dir).await;
            return ControlFlow::Break;
        }
        if self.check_cancelled(job_id, working_dir).await {
            return ControlFlow::Break;
        }

        let rows: Vec<metrics::PolygonMetrics> =
            images.iter().flat_map(|img| metrics::compute_image_metrics(img.image_id, &img.polygons)).collect();

        let total = options.metrics_formats.len().max(1);
        for (i, format) in options.metrics_formats.iter().enumerate() {
            if self.check_cancelled(job_id, working_dir).await {
                return ControlFlow::Break;
            }
            let ext = metrics::extension_for(*format);
            let path = dest_dir.join(format!("metrics.{ext}"));
            let result = match format {
                seg_store::entities::MetricsFormat::Excel => metrics::write_xlsx(&rows, &path),
                seg_store::entities::MetricsFormat::Csv => metrics::write_csv(&rows, &path),
                seg_store::entities::MetricsFormat::Json => metrics::write_json(&rows, &path),
            };
            if let Err(e) = result {
                self.fail(job_id, &e.to_string()).await;
                self.cleanup(working_dir).await;
                return ControlFlow::Break;
            }
            self.emit_progress(job_id, ExportPhase::Metrics, (i + 1) as f32 / total as f32).await;
        }
        ControlFlow::Continue
    }

    async fn run_compression_phase(&self, job_id: ExportJobId, working_dir: &Path) {
        if self.check_cancelled(job_id, working_dir).await {
            return;
        }
        let archive_path = self.archive_path(job_id);
        if let Err(e) = archive::build_archive(working_dir, &archive_path) {
            self.fail(job_id, &e.to_string()).await;
            self.cleanup(working_dir).await;
            return;
        }
        self.emit_progress(job_id, ExportPhase::Compression, 0.5).await;

        let checksum = match archive::sha256_file(&archive_path) {
            Ok(c) => c,
            Err(e) => {
                self.fail(job_id, &e.to_string()).await;
                self.cleanup(working_dir).await;
                return;
            }
        };

        match ExportJobStore::complete(&self.pool, job_id, &archive_path.to_string_lossy(), &checksum).await {
            Ok(true) => {
                self.emit_progress(job_id, ExportPhase::Compression, 1.0).await;
                self.bus
                    .publish(
                        Room::Export(job_id),
                        Envelope::new(event_names::EXPORT_COMPLETED, ExportTerminalEvent { job_id, code: None, message: None }),
                    )
                    .await;
                info!(%job_id, "export job completed");
            }
            Ok(false) => {
                info!(%job_id, "completion arrived for non-processing export job, dropped (cancellation race)");
            }
            Err(e) => warn!(%job_id, error = %e, "failed to record export job completion"),
        }

        let _ = tokio::fs::remove_dir_all(working_dir).await;
    }

    async fn fail(&self, job_id: ExportJobId, message: &str) {
        error!(%job_id, error = message, "export job failed");
        match ExportJobStore::fail(&self.pool, job_id, AppError::Internal(message.to_string()).code(), message).await {
            Ok(true) => {
                self.bus
                    .publish(
                        Room::Export(job_id),
                        Envelope::new(
                            event_names::EXPORT_FAILED,
                            ExportTerminalEvent { job_id, code: Some("Internal".into()), message: Some(message.to_string()) },
                        ),
                    )
                    .await;
            }
            Ok(false) => {}
            Err(e) => warn!(%job_id, error = %e, "failed to record export job failure"),
        }
    }

    async fn cleanup(&self, working_dir: &Path) {
        let _ = tokio::fs::remove_dir_all(working_dir).await;
    }
}

enum ControlFlow {
    Continue,
    Break,
}

impl ControlFlow {
    fn is_break(&self) -> bool {
        matches!(self, ControlFlow::Break)
    }
}

enum PhaseOutcome {
    Ok,
    Cancelled,
    FailureCount(usize),
}

/// §4.3 "Resumption": on process restart, any job stuck `processing` is
/// marked `failed` with `errorCode=Interrupted`.
pub async fn recover_interrupted(pool: &PgPool) -> AppResult<()> {
    let failed = ExportJobStore::fail_interrupted(pool).await?;
    if failed > 0 {
        info!(count = failed, "marked interrupted export jobs as failed on startup");
    }
    Ok(())
}

/// Periodic sweep (§12 retention): working directories for jobs that
/// never reached a terminal state within `older_than_hours` are orphaned
/// disk usage and get cleaned up alongside marking the job failed.
pub async fn sweep_stale_temp(pool: &PgPool, upload_dir: &str, older_than_hours: i64) -> AppResult<()> {
    let stale = ExportJobStore::sweep_stale_temp_candidates(pool, older_than_hours).await?;
    for job_id in stale {
        let _ = ExportJobStore::fail(pool, job_id, "Interrupted", "export job exceeded its wall-clock budget").await;
        let dir = Path::new(upload_dir).join("exports").join(job_id.as_uuid().to_string());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
    Ok(())
}
