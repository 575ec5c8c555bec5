//! Caller identity extraction. No request/session/identity-provider
//! layer is defined elsewhere, so this is the minimal stand-in that
//! gets a `UserId` into every handler without inventing a login flow.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use seg_core::{AppError, UserId};

const USER_ID_HEADER: &str = "x-user-id";

/// Resolved caller identity for one request. A real deployment would
/// front this with a session cookie or bearer token; for now the header
/// is treated as already-authenticated input from a trusted upstream
/// proxy.
pub struct CurrentUser(pub UserId);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or(AppError::Unauthorized)?
            .to_str()
            .map_err(|_| AppError::Unauthorized)?;
        header.parse::<UserId>().map(CurrentUser).map_err(|_| AppError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[tokio::test]
    async fn missing_header_is_unauthorized() {
        let req = Request::builder().body(()).unwrap();
        let (mut parts, _) = req.into_parts();
        let result = CurrentUser::from_request_parts(&mut parts, &()).await;
        assert!(matches!(result, Err(AppError::Unauthorized)));
    }

    #[tokio::test]
    async fn valid_uuid_header_resolves() {
        let id = UserId::new();
        let req = Request::builder().header(USER_ID_HEADER, id.to_string()).body(()).unwrap();
        let (mut parts, _) = req.into_parts();
        let CurrentUser(resolved) = CurrentUser::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(resolved, id);
    }
}
