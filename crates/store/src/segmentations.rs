use sqlx::PgPool;

use seg_core::{AppError, AppResult, ImageId, SegmentationId};

use crate::entities::{Polygon, Segmentation};

pub struct SegmentationStore;

impl SegmentationStore {
    pub async fn get_for_image(pool: &PgPool, image_id: ImageId) -> AppResult<Option<Segmentation>> {
        Ok(sqlx::query_as("SELECT * FROM segmentations WHERE image_id = $1")
            .bind(image_id)
            .fetch_optional(pool)
            .await?)
    }

    pub async fn get(pool: &PgPool, id: SegmentationId) -> AppResult<Segmentation> {
        sqlx::query_as("SELECT * FROM segmentations WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("segmentation {id}")))
    }

    /// A re-run replaces the prior Segmentation atomically (§3 invariant):
    /// delete-then-insert inside one transaction, enforced by the 1:1
    /// unique index on `image_id`.
    pub async fn replace(
        pool: &PgPool,
        image_id: ImageId,
        polygons: &[Polygon],
        model: &str,
        confidence_threshold: f32,
        processing_duration_ms: i64,
    ) -> AppResult<SegmentationId> {
        let mut txn = pool.begin().await?;
        sqlx::query("DELETE FROM segmentations WHERE image_id = $1")
            .bind(image_id)
            .execute(&mut *txn)
            .await?;

        let id = SegmentationId::new();
        let payload = serde_json::to_value(polygons)
            .map_err(|e| AppError::Internal(format!("serializing polygons: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO segmentations
                (id, image_id, polygons, model, confidence_threshold, processing_duration_ms)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(image_id)
        .bind(payload)
        .bind(model)
        .bind(confidence_threshold)
        .bind(processing_duration_ms)
        .execute(&mut *txn)
        .await?;

        txn.commit().await?;
        Ok(id)
    }
}
