use chrono::Utc;
use sqlx::PgPool;

use seg_core::{AppError, AppResult, ImageId, ProjectId, QueueItemId, UserId};

use crate::entities::QueueItem;

/// Stateless entity store, mirroring `source_store.rs`'s
/// `IngestionSourceStore` unit struct with async methods taking `&PgPool`.
pub struct QueueItemStore;

pub struct NewQueueItem {
    pub user_id: UserId,
    pub project_id: ProjectId,
    pub image_id: ImageId,
    pub model: String,
    pub threshold: f32,
    pub detect_holes: bool,
    pub batch_id: uuid::Uuid,
}

impl QueueItemStore {
    /// Creates QueueItems for a batch inside one transaction. Fails with
    /// `Conflict` if any image already has a non-terminal item, enforced
    /// by the partial unique index and mapped from the 23505 violation.
    pub async fn create_batch(
        pool: &PgPool,
        items: Vec<NewQueueItem>,
    ) -> AppResult<Vec<QueueItemId>> {
        let mut txn = pool.begin().await?;
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let id = QueueItemId::new();
            let result = sqlx::query(
                r#"
                INSERT INTO queue_items
                    (id, user_id, project_id, image_id, model, threshold, detect_holes, batch_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(id)
            .bind(item.user_id)
            .bind(item.project_id)
            .bind(item.image_id)
            .bind(&item.model)
            .bind(item.threshold)
            .bind(item.detect_holes)
            .bind(item.batch_id)
            .execute(&mut *txn)
            .await;

            match result {
                Ok(_) => ids.push(id),
                Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
                    return Err(AppError::Conflict(format!(
                        "image {} already has a queued or processing item",
                        item.image_id
                    )));
                }
                Err(e) => return Err(e.into()),
            }

            sqlx::query("UPDATE images SET segmentation_status = 'queued' WHERE id = $1")
                .bind(item.image_id)
                .execute(&mut *txn)
                .await?;
        }
        txn.commit().await?;
        Ok(ids)
    }

    /// Atomically moves up to `limit` `queued` items belonging to `user_id`
    /// into `processing`, returning the claimed rows in FIFO order
    /// (`enqueuedAt`, tie-broken by id). Runs at serializable isolation
    /// per §5, retried on serialization failure per §4.1.
    pub async fn claim_next(
        pool: &PgPool,
        user_id: UserId,
        limit: i64,
    ) -> AppResult<Vec<QueueItem>> {
        crate::retry::with_serializable_retry(|| Self::claim_next_once(pool, user_id, limit)).await
    }

    async fn claim_next_once(
        pool: &PgPool,
        user_id: UserId,
        limit: i64,
    ) -> Result<Vec<QueueItem>, sqlx::Error> {
        let mut txn = pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *txn)
            .await?;

        let claimed: Vec<QueueItem> = sqlx::query_as(
            r#"
            UPDATE queue_items
            SET status = 'processing', started_at = now()
            WHERE id IN (
                SELECT id FROM queue_items
                WHERE user_id = $1 AND status = 'queued'
                ORDER BY enqueued_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&mut *txn)
        .await?;

        for item in &claimed {
            sqlx::query("UPDATE images SET segmentation_status = 'processing' WHERE id = $1")
                .bind(item.image_id)
                .execute(&mut *txn)
                .await?;
        }

        txn.commit().await?;
        Ok(claimed)
    }

    /// Users with at least one `queued` item, for the dispatcher's
    /// round-robin enumeration.
    pub async fn users_with_queued_items(pool: &PgPool) -> AppResult<Vec<UserId>> {
        let rows: Vec<(UserId,)> = sqlx::query_as(
            "SELECT DISTINCT user_id FROM queue_items WHERE status = 'queued' ORDER BY user_id",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn count_processing_for_user(pool: &PgPool, user_id: UserId) -> AppResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM queue_items WHERE user_id = $1 AND status = 'processing'",
        )
        .bind(user_id)
        .fetch_one(pool)
        .await?;
        Ok(count)
    }

    pub async fn count_processing_global(pool: &PgPool) -> AppResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM queue_items WHERE status = 'processing'")
                .fetch_one(pool)
                .await?;
        Ok(count)
    }

    pub async fn get(pool: &PgPool, id: QueueItemId) -> AppResult<QueueItem> {
        sqlx::query_as("SELECT * FROM queue_items WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("queue item {id}")))
    }

    /// Conditional write enforcing invariant 1 (§8): a terminal write only
    /// succeeds if the row's current status matches `expected`.
    pub async fn transition_if(
        pool: &PgPool,
        id: QueueItemId,
        expected: &str,
        new_status: &str,
    ) -> AppResult<bool> {
        let completed_at_clause = if matches!(new_status, "completed" | "failed" | "cancelled") {
            ", completed_at = now()"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE queue_items SET status = $1{completed_at_clause} WHERE id = $2 AND status = $3"
        );
        let result = sqlx::query(&sql)
            .bind(new_status)
            .bind(id)
            .bind(expected)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn record_failure(
        pool: &PgPool,
        id: QueueItemId,
        expected: &str,
        error_code: &str,
        error_message: &str,
        retry_count: i32,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'failed', completed_at = now(),
                error_code = $1, error_message = $2, retry_count = $3
            WHERE id = $4 AND status = $5
            "#,
        )
        .bind(error_code)
        .bind(error_message)
        .bind(retry_count)
        .bind(id)
        .bind(expected)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Cancels `queued` items by id, skipping any already `processing`.
    /// Returns (cancelled image ids, skipped ids) per §4.2 `cancelItems`.
    pub async fn cancel_queued(
        pool: &PgPool,
        user_id: UserId,
        ids: &[QueueItemId],
    ) -> AppResult<(Vec<(QueueItemId, ImageId)>, Vec<QueueItemId>)> {
        let mut txn = pool.begin().await?;
        let mut cancelled = Vec::new();
        let mut skipped = Vec::new();

        for &id in ids {
            let row: Option<(String, ImageId)> = sqlx::query_as(
                "SELECT status, image_id FROM queue_items WHERE id = $1 AND user_id = $2 FOR UPDATE",
            )
            .bind(id)
            .bind(user_id)
            .fetch_optional(&mut *txn)
            .await?;

            match row {
                Some((status, image_id)) if status == "queued" => {
                    sqlx::query(
                        "UPDATE queue_items SET status = 'cancelled', completed_at = now() WHERE id = $1",
                    )
                    .bind(id)
                    .execute(&mut *txn)
                    .await?;
                    sqlx::query("UPDATE images SET segmentation_status = 'none' WHERE id = $1")
                        .bind(image_id)
                        .execute(&mut *txn)
                        .await?;
                    cancelled.push((id, image_id));
                }
                Some(_) => skipped.push(id),
                None => skipped.push(id),
            }
        }

        txn.commit().await?;
        Ok((cancelled, skipped))
    }

    pub async fn queued_ids_for_project(
        pool: &PgPool,
        project_id: ProjectId,
    ) -> AppResult<Vec<QueueItemId>> {
        let rows: Vec<(QueueItemId,)> = sqlx::query_as(
            "SELECT id FROM queue_items WHERE project_id = $1 AND status = 'queued'",
        )
        .bind(project_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn queued_ids_for_user(pool: &PgPool, user_id: UserId) -> AppResult<Vec<QueueItemId>> {
        let rows: Vec<(QueueItemId,)> =
            sqlx::query_as("SELECT id FROM queue_items WHERE user_id = $1 AND status = 'queued'")
                .bind(user_id)
                .fetch_all(pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn stats_for_project(pool: &PgPool, project_id: ProjectId) -> AppResult<(i64, i64)> {
        let (queued,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM queue_items WHERE project_id = $1 AND status = 'queued'",
        )
        .bind(project_id)
        .fetch_one(pool)
        .await?;
        let (processing,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM queue_items WHERE project_id = $1 AND status = 'processing'",
        )
        .bind(project_id)
        .fetch_one(pool)
        .await?;
        Ok((queued, processing))
    }

    /// Background retention sweep: deletes completed/failed/cancelled
    /// items older than `older_than_days`.
    pub async fn purge_completed(pool: &PgPool, older_than_days: i64) -> AppResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
        let result = sqlx::query(
            "DELETE FROM queue_items WHERE status IN ('completed', 'failed', 'cancelled') AND completed_at < $1",
        )
        .bind(cutoff)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// §7 `Interrupted`: on restart, any item left `processing` is a
    /// crash artifact (the worker holding it died) and converts to
    /// `failed`.
    pub async fn fail_interrupted(pool: &PgPool) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'failed', completed_at = now(), error_code = 'Interrupted',
                error_message = 'process restarted while item was processing'
            WHERE status = 'processing'
            "#,
        )
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_queue_item_carries_batch_id() {
        let batch_id = uuid::Uuid::new_v4();
        let item = NewQueueItem {
            user_id: UserId::new(),
            project_id: ProjectId::new(),
            image_id: ImageId::new(),
            model: "cellpose".into(),
            threshold: 0.5,
            detect_holes: true,
            batch_id,
        };
        assert_eq!(item.batch_id, batch_id);
    }
}
