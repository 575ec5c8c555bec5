use sqlx::PgPool;

use seg_core::{AppError, AppResult, ImageId, ProjectId};

use crate::entities::Image;

pub struct ImageStore;

impl ImageStore {
    pub async fn get(pool: &PgPool, id: ImageId) -> AppResult<Image> {
        sqlx::query_as("SELECT * FROM images WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("image {id}")))
    }

    pub async fn list_for_project(pool: &PgPool, project_id: ProjectId) -> AppResult<Vec<Image>> {
        Ok(sqlx::query_as("SELECT * FROM images WHERE project_id = $1 ORDER BY created_at")
            .bind(project_id)
            .fetch_all(pool)
            .await?)
    }

    pub async fn list_by_ids(pool: &PgPool, ids: &[ImageId]) -> AppResult<Vec<Image>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let uuids: Vec<uuid::Uuid> = ids.iter().map(|i| i.as_uuid()).collect();
        Ok(sqlx::query_as("SELECT * FROM images WHERE id = ANY($1) ORDER BY created_at")
            .bind(uuids)
            .fetch_all(pool)
            .await?)
    }

    pub async fn set_thumbnail(
        pool: &PgPool,
        id: ImageId,
        thumbnail_path: &str,
    ) -> AppResult<()> {
        sqlx::query("UPDATE images SET thumbnail_path = $1 WHERE id = $2")
            .bind(thumbnail_path)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Invariant (§3): `segmentation_thumbnail_path` is non-empty iff
    /// `status = segmented`; both fields are always written together.
    pub async fn mark_segmented(
        pool: &PgPool,
        id: ImageId,
        segmentation_thumbnail_path: &str,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE images SET segmentation_status = 'segmented', segmentation_thumbnail_path = $1 WHERE id = $2",
        )
        .bind(segmentation_thumbnail_path)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(pool: &PgPool, id: ImageId) -> AppResult<()> {
        sqlx::query("UPDATE images SET segmentation_status = 'failed' WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn reset_to_none(pool: &PgPool, id: ImageId) -> AppResult<()> {
        sqlx::query("UPDATE images SET segmentation_status = 'none' WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}
