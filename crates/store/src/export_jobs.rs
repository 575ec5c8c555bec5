use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;

use seg_core::{AppError, AppResult, ExportJobId, ProjectId, UserId};

use crate::entities::ExportJob;

pub struct ExportJobStore;

impl ExportJobStore {
    pub async fn create(
        pool: &PgPool,
        project_id: ProjectId,
        user_id: UserId,
        options: Value,
    ) -> AppResult<ExportJobId> {
        let id = ExportJobId::new();
        sqlx::query(
            "INSERT INTO export_jobs (id, project_id, user_id, options) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(project_id)
        .bind(user_id)
        .bind(options)
        .execute(pool)
        .await?;
        Ok(id)
    }

    pub async fn get(pool: &PgPool, id: ExportJobId) -> AppResult<ExportJob> {
        sqlx::query_as("SELECT * FROM export_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("export job {id}")))
    }

    pub async fn set_phase_progress(
        pool: &PgPool,
        id: ExportJobId,
        phase: &str,
        progress: f32,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE export_jobs SET status = 'processing', phase = $1, progress = $2 WHERE id = $3 AND status != 'cancelled'",
        )
        .bind(phase)
        .bind(progress)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Conditional completion write: a job already `cancelled` is never
    /// resurrected into `completed` (§4.3, §4.4 Reconciler contract).
    pub async fn complete(
        pool: &PgPool,
        id: ExportJobId,
        artifact_path: &str,
        checksum_sha256: &str,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'completed', phase = 'ready', progress = 100,
                artifact_path = $1, checksum_sha256 = $2, completed_at = now()
            WHERE id = $3 AND status = 'processing'
            "#,
        )
        .bind(artifact_path)
        .bind(checksum_sha256)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn fail(pool: &PgPool, id: ExportJobId, error_code: &str, error_message: &str) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'failed', completed_at = now(), error_code = $1, error_message = $2
            WHERE id = $3 AND status != 'cancelled'
            "#,
        )
        .bind(error_code)
        .bind(error_message)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Idempotent cancel (§8 property 5): repeated calls against an
    /// already-cancelled job are a no-op success.
    pub async fn cancel(pool: &PgPool, id: ExportJobId) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'cancelled', cancelled_at = now()
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn is_cancelled(pool: &PgPool, id: ExportJobId) -> AppResult<bool> {
        let (status,): (String,) = sqlx::query_as("SELECT status FROM export_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("export job {id}")))?;
        Ok(status == "cancelled")
    }

    /// §6 "Persisted state layout": crash resumption marks interrupted
    /// jobs `failed` with `errorCode=Interrupted` unless a future
    /// redesign adds phase checkpoint restart (§4.3 resumption note).
    pub async fn fail_interrupted(pool: &PgPool) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'failed', completed_at = now(), error_code = 'Interrupted',
                error_message = 'process restarted mid-export'
            WHERE status = 'processing'
            "#,
        )
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn sweep_stale_temp_candidates(pool: &PgPool, older_than_hours: i64) -> AppResult<Vec<ExportJobId>> {
        let cutoff = Utc::now() - chrono::Duration::hours(older_than_hours);
        let rows: Vec<(ExportJobId,)> = sqlx::query_as(
            "SELECT id FROM export_jobs WHERE status NOT IN ('completed', 'failed', 'cancelled') AND started_at < $1",
        )
        .bind(cutoff)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
