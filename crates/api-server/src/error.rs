//! API error types and the stable error envelope.

use std::collections::HashMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use identity::IdentityError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Error envelope returned by every failing endpoint.
///
/// `path` is stamped by the outermost middleware layer, which is the only
/// place that still knows the request URI once a response exists.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// When the error was produced.
    pub timestamp: DateTime<Utc>,
    /// HTTP status code.
    pub status: u16,
    /// Stable error category for programmatic handling.
    pub error: String,
    /// Human-readable message.
    pub message: String,
    /// Request path that produced the error.
    pub path: String,
    /// Per-field messages for validation failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_errors: Option<HashMap<String, String>>,
}

/// API error type.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation failed")]
    Validation(HashMap<String, String>),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ApiError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Duplicate(_) => StatusCode::CONFLICT,
            ApiError::InvalidState(_) => StatusCode::CONFLICT,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error category string.
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::Duplicate(_) => "DUPLICATE_IDENTITY",
            ApiError::InvalidState(_) => "INVALID_STATE",
            ApiError::RateLimited => "RATE_LIMITED",
            ApiError::Internal(_) => "INTERNAL_ERROR",
            ApiError::Database(_) => "DATABASE_ERROR",
        }
    }

    /// Client-facing message. Server-side faults keep their detail in the
    /// logs and return a generic line.
    fn client_message(&self) -> String {
        match self {
            ApiError::NotFound(m)
            | ApiError::BadRequest(m)
            | ApiError::Unauthorized(m)
            | ApiError::Forbidden(m)
            | ApiError::Duplicate(m)
            | ApiError::InvalidState(m) => m.clone(),
            ApiError::Validation(_) => "Validation failed".to_string(),
            ApiError::RateLimited => "Too many requests, try again later".to_string(),
            ApiError::Internal(_) | ApiError::Database(_) => {
                "An unexpected error occurred".to_string()
            }
        }
    }

    fn validation_errors(&self) -> Option<HashMap<String, String>> {
        match self {
            ApiError::Validation(errors) => Some(errors.clone()),
            _ => None,
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::NotFound(m) => ApiError::NotFound(m),
            IdentityError::DuplicateIdentity(m) => ApiError::Duplicate(m),
            IdentityError::InvalidState(m) => ApiError::InvalidState(m),
            IdentityError::Storage(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // 500s indicate bugs or infrastructure failures; keep the detail in
        // the logs since the client only sees a generic message.
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(
                error_code = self.error_code(),
                error = %self,
                "Internal server error"
            );
        }

        let body = ErrorBody {
            timestamp: Utc::now(),
            status: status.as_u16(),
            error: self.error_code().to_string(),
            message: self.client_message(),
            path: String::new(),
            validation_errors: self.validation_errors(),
        };

        // The envelope rides along as an extension so the path-stamping
        // middleware can rebuild it without re-parsing the body.
        let mut response = (status, Json(body.clone())).into_response();
        response.extensions_mut().insert(body);
        response
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Duplicate("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::InvalidState("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::RateLimited.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::Validation(HashMap::new()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_identity_error_mapping() {
        let err: ApiError = IdentityError::NotFound("Account not found".into()).into();
        assert!(matches!(err, ApiError::NotFound(_)));

        let err: ApiError =
            IdentityError::DuplicateIdentity("Username is already in use".into()).into();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.error_code(), "DUPLICATE_IDENTITY");

        let err: ApiError =
            IdentityError::InvalidState("Cannot delete the last administrator account".into())
                .into();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.error_code(), "INVALID_STATE");

        let err: ApiError = IdentityError::Storage(anyhow::anyhow!("connection refused")).into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_internal_detail_not_leaked() {
        let err = ApiError::Internal("pool timeout talking to 10.0.0.3".into());
        assert_eq!(err.client_message(), "An unexpected error occurred");
    }

    #[test]
    fn test_envelope_serialization() {
        let body = ErrorBody {
            timestamp: Utc::now(),
            status: 404,
            error: "NOT_FOUND".into(),
            message: "Account not found".into(),
            path: "/api/v1/users/123".into(),
            validation_errors: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], 404);
        assert_eq!(json["error"], "NOT_FOUND");
        assert_eq!(json["path"], "/api/v1/users/123");
        // Absent map is omitted entirely, not serialized as null.
        assert!(json.get("validationErrors").is_none());

        let body = ErrorBody {
            validation_errors: Some(HashMap::from([(
                "email".to_string(),
                "Invalid email address".to_string(),
            )])),
            ..body
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["validationErrors"]["email"], "Invalid email address");
    }
}
