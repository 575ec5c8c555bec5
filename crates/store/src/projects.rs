use sqlx::PgPool;

use seg_core::{AppError, AppResult, ProjectId, UserId};

use crate::entities::Project;

pub struct ProjectStore;

impl ProjectStore {
    pub async fn get(pool: &PgPool, id: ProjectId) -> AppResult<Project> {
        sqlx::query_as("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("project {id}")))
    }

    /// Access closure per §8 property 7: owner, or caller has an
    /// effectively-accepted share.
    pub async fn user_can_access(
        pool: &PgPool,
        project_id: ProjectId,
        user_id: UserId,
    ) -> AppResult<bool> {
        let project = Self::get(pool, project_id).await?;
        if project.owner_id == user_id {
            return Ok(true);
        }
        let (accepted,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM project_shares
                WHERE project_id = $1 AND shared_with_id = $2 AND status = 'accepted'
                  AND (token_expiry IS NULL OR token_expiry > now())
            )
            "#,
        )
        .bind(project_id)
        .bind(user_id)
        .fetch_one(pool)
        .await?;
        Ok(accepted)
    }

    /// Owner plus every accepted-share recipient, for fan-out in
    /// StatsAggregator and the bus's `project:{id}` room membership.
    pub async fn accessible_user_ids(pool: &PgPool, project_id: ProjectId) -> AppResult<Vec<UserId>> {
        let project = Self::get(pool, project_id).await?;
        let mut ids = vec![project.owner_id];
        let shared: Vec<(UserId,)> = sqlx::query_as(
            r#"
            SELECT shared_with_id FROM project_shares
            WHERE project_id = $1 AND status = 'accepted' AND shared_with_id IS NOT NULL
              AND (token_expiry IS NULL OR token_expiry > now())
            "#,
        )
        .bind(project_id)
        .fetch_all(pool)
        .await?;
        ids.extend(shared.into_iter().map(|(id,)| id));
        Ok(ids)
    }

    /// Every project `user_id` owns or has an accepted share on, for the
    /// dashboard metrics rollup.
    pub async fn ids_for_user(pool: &PgPool, user_id: UserId) -> AppResult<Vec<ProjectId>> {
        let rows: Vec<(ProjectId,)> = sqlx::query_as(
            r#"
            SELECT id FROM projects WHERE owner_id = $1
            UNION
            SELECT project_id FROM project_shares
            WHERE shared_with_id = $1 AND status = 'accepted'
              AND (token_expiry IS NULL OR token_expiry > now())
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
