//! Retry wrapper for CAS-guarded/serializable transactions (§4.1:
//! "retries on deadlock/serialization failures with exponential backoff
//! capped at three attempts"). Same shape as the inference retry loop
//! in the queue crate (fixed backoff schedule, bounded attempt count),
//! applied here to Postgres's 40001/40P01 error classes instead of
//! transient inference failures.

use std::time::Duration;

use seg_core::{AppError, AppResult};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFFS: [Duration; 2] = [Duration::from_millis(20), Duration::from_millis(80)];

fn is_retryable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}

/// Runs `f` up to `MAX_ATTEMPTS` times, retrying only on serialization
/// failure or deadlock. Any other error, or exhausting the attempt
/// budget, is returned as-is.
pub async fn with_serializable_retry<F, Fut, T>(mut f: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if is_retryable(&e) && attempt + 1 < MAX_ATTEMPTS => {
                tokio::time::sleep(BACKOFFS[attempt as usize % BACKOFFS.len()]).await;
                attempt += 1;
            }
            Err(e) => return Err(AppError::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_immediately_when_first_attempt_works() {
        let calls = AtomicU32::new(0);
        let result = with_serializable_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, sqlx::Error>(42)
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result = with_serializable_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<i32, _>(sqlx::Error::RowNotFound)
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
