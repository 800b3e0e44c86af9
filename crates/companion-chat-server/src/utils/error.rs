use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failure: {0}")]
    Validation(String),

    #[error("Upstream generation failure: {0}")]
    UpstreamGeneration(String),

    #[error("Transport protocol error: {0}")]
    TransportProtocol(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Stable machine-readable code, shared by HTTP bodies, SSE error events
    /// and duplex error frames.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Validation(_) => "VALIDATION_FAILURE",
            ApiError::UpstreamGeneration(_) => "UPSTREAM_GENERATION_FAILURE",
            ApiError::TransportProtocol(_) => "TRANSPORT_PROTOCOL_ERROR",
            ApiError::Database(_) => "DATABASE_ERROR",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) | ApiError::TransportProtocol(_) => StatusCode::BAD_REQUEST,
            ApiError::UpstreamGeneration(_) => StatusCode::BAD_GATEWAY,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message without the variant prefix.
    pub fn detail(&self) -> &str {
        match self {
            ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::Validation(msg)
            | ApiError::UpstreamGeneration(msg)
            | ApiError::TransportProtocol(msg)
            | ApiError::Database(msg)
            | ApiError::Internal(msg) => msg,
        }
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, ApiError::UpstreamGeneration(_))
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Database(err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        // Adapters wrap typed errors in anyhow; keep the original variant when present.
        match err.downcast::<ApiError>() {
            Ok(api) => api,
            Err(other) => ApiError::Internal(format!("{:#}", other)),
        }
    }
}

/// `{code, message}` payload used by SSE error events and duplex error frames.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl From<&ApiError> for ErrorInfo {
    fn from(err: &ApiError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.detail().to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            ApiError::Database(msg) | ApiError::Internal(msg) => {
                tracing::error!(code = self.code(), "{}", msg);
            }
            ApiError::UpstreamGeneration(msg) => {
                tracing::error!(code = self.code(), "{}", msg);
            }
            other => {
                tracing::warn!(code = other.code(), "{}", other.detail());
            }
        }

        let body = Json(ErrorResponse {
            error: self.code().to_string(),
            message: self.detail().to_string(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_statuses() {
        let err = ApiError::Validation("empty".into());
        assert_eq!(err.code(), "VALIDATION_FAILURE");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = ApiError::UpstreamGeneration("timeout".into());
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert!(err.is_upstream());
    }

    #[test]
    fn test_anyhow_roundtrip_keeps_variant() {
        let wrapped: anyhow::Error = ApiError::NotFound("character".into()).into();
        let back: ApiError = wrapped.into();
        assert!(matches!(back, ApiError::NotFound(ref m) if m == "character"));
    }

    #[test]
    fn test_error_info_from_api_error() {
        let info = ErrorInfo::from(&ApiError::Forbidden("not yours".into()));
        assert_eq!(info.code, "FORBIDDEN");
        assert_eq!(info.message, "not yours");
    }
}
