use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::PgPool;

use seg_core::{AppError, AppResult, ProjectId, ShareId, UserId};

use crate::entities::ProjectShare;

pub struct ShareStore;

impl ShareStore {
    pub async fn create(
        pool: &PgPool,
        project_id: ProjectId,
        shared_by_id: UserId,
        email: Option<String>,
        shared_with_id: Option<UserId>,
        token_expiry: Option<DateTime<Utc>>,
    ) -> AppResult<ProjectShare> {
        let id = ShareId::new();
        let token = generate_token();
        sqlx::query(
            r#"
            INSERT INTO project_shares
                (id, project_id, shared_by_id, email, shared_with_id, share_token, token_expiry)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(id)
        .bind(project_id)
        .bind(shared_by_id)
        .bind(&email)
        .bind(shared_with_id)
        .bind(&token)
        .bind(token_expiry)
        .execute(pool)
        .await?;

        sqlx::query_as("SELECT * FROM project_shares WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
            .map_err(AppError::from)
    }

    pub async fn accept(pool: &PgPool, token: &str, user_id: UserId) -> AppResult<ProjectShare> {
        let result = sqlx::query(
            r#"
            UPDATE project_shares
            SET status = 'accepted', shared_with_id = COALESCE(shared_with_id, $1)
            WHERE share_token = $2 AND status = 'pending'
              AND (token_expiry IS NULL OR token_expiry > now())
            "#,
        )
        .bind(user_id)
        .bind(token)
        .execute(pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(AppError::Conflict("share is not pending or has expired".into()));
        }

        sqlx::query_as("SELECT * FROM project_shares WHERE share_token = $1")
            .bind(token)
            .fetch_one(pool)
            .await
            .map_err(AppError::from)
    }

    pub async fn revoke(pool: &PgPool, id: ShareId, owner_id: UserId) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE project_shares SET status = 'revoked'
            WHERE id = $1 AND shared_by_id = $2 AND status IN ('pending', 'accepted')
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .execute(pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("share {id}")));
        }
        Ok(())
    }

    pub async fn list_for_project(pool: &PgPool, project_id: ProjectId) -> AppResult<Vec<ProjectShare>> {
        Ok(sqlx::query_as("SELECT * FROM project_shares WHERE project_id = $1")
            .bind(project_id)
            .fetch_all(pool)
            .await?)
    }
}

fn generate_token() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..32).map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_32_chars_and_url_safe() {
        let token = generate_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
