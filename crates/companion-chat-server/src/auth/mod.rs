//! Caller identity. The gateway validates the user and forwards the id; this
//! layer only reads it.

use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use serde::Deserialize;
use uuid::Uuid;

use crate::utils::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Authenticated user id from the `X-User-Id` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub Uuid);

/// Like [`AuthUser`], but also accepts `?userId=` since browsers cannot set
/// headers on websocket upgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplexUser(pub Uuid);

#[derive(Deserialize)]
struct UserIdQuery {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

fn parse_user_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| ApiError::Unauthorized("User id is not a valid UUID".to_string()))
}

fn from_header(parts: &Parts) -> Option<Result<Uuid, ApiError>> {
    let value = parts.headers.get(USER_ID_HEADER)?;
    Some(
        value
            .to_str()
            .map_err(|_| ApiError::Unauthorized("User id header is not valid text".to_string()))
            .and_then(parse_user_id),
    )
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match from_header(parts) {
            Some(id) => id.map(AuthUser),
            None => Err(ApiError::Unauthorized("Missing X-User-Id header".to_string())),
        }
    }
}

impl<S> FromRequestParts<S> for DuplexUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(id) = from_header(parts) {
            return id.map(DuplexUser);
        }

        let Query(query) = Query::<UserIdQuery>::try_from_uri(&parts.uri)
            .map_err(|_| ApiError::Unauthorized("Malformed query string".to_string()))?;
        match query.user_id {
            Some(raw) => parse_user_id(&raw).map(DuplexUser),
            None => Err(ApiError::Unauthorized(
                "Missing X-User-Id header or userId query parameter".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(uri: &str, header: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = header {
            builder = builder.header(USER_ID_HEADER, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn test_header_identity() {
        let id = Uuid::new_v4();
        let mut p = parts("/api/conversations", Some(&id.to_string()));
        assert_eq!(AuthUser::from_request_parts(&mut p, &()).await.unwrap(), AuthUser(id));

        let mut p = parts("/api/conversations", Some("nope"));
        assert!(matches!(
            AuthUser::from_request_parts(&mut p, &()).await,
            Err(ApiError::Unauthorized(_))
        ));

        let mut p = parts(&format!("/api/conversations?userId={}", id), None);
        assert!(AuthUser::from_request_parts(&mut p, &()).await.is_err());
    }

    #[tokio::test]
    async fn test_duplex_accepts_query() {
        let id = Uuid::new_v4();
        let mut p = parts(&format!("/ws?userId={}", id), None);
        assert_eq!(DuplexUser::from_request_parts(&mut p, &()).await.unwrap(), DuplexUser(id));

        let mut p = parts("/ws", None);
        assert!(DuplexUser::from_request_parts(&mut p, &()).await.is_err());
    }
}
