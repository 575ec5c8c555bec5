//! OpenAPI documentation aggregator, served via Scalar UI at `/docs`.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Segmentation Platform API",
        version = "0.1.0",
        description = "Segmentation queue, export, and realtime event endpoints.",
    ),
    tags(
        (name = "Segmentation", description = "Segmentation batch enqueue and cancellation"),
        (name = "Export", description = "Export job lifecycle"),
    ),
    paths(
        crate::api::segmentation::enqueue_batch,
        crate::api::export::start_export,
        crate::api::export::export_status,
        crate::api::export::cancel_export,
    )
)]
pub struct ApiDoc;
