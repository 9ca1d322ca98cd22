use crate::services::blob_store::BlobError;
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Domain outcomes shared by the serving-path services.
///
/// Every terminal variant maps to its own status and machine-readable code at
/// the HTTP boundary; `Database` and `Blob` are internal and surfaced generically.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid API key")]
    InvalidCredential,
    #[error("file of {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { size: i64, limit: i64 },
    #[error("storage quota exceeded: {used} used + {requested} requested > {quota}")]
    QuotaExceeded {
        used: i64,
        requested: i64,
        quota: i64,
    },
    #[error("file type not supported")]
    UnsupportedType,
    #[error("file not found")]
    NotFound,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Blob(#[from] BlobError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// An error ready to be rendered as `{"error": {message, type, code}}`.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub kind: &'static str,
    pub code: &'static str,
    /// Seconds until the caller may retry; sent as `Retry-After`.
    pub retry_after: Option<u64>,
}

impl AppError {
    pub fn new(
        status: StatusCode,
        kind: &'static str,
        code: &'static str,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            status,
            message: msg.into(),
            kind,
            code,
            retry_after: None,
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "internal_error",
            msg,
        )
    }

    pub fn unauthorized(code: &'static str, msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", code, msg)
    }

    pub fn bad_request(code: &'static str, msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", code, msg)
    }

    pub fn rate_limited(msg: impl Into<String>, retry_after: u64) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_exceeded",
                "rate_limit_exceeded",
                msg,
            )
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "type": self.kind,
                "code": self.code,
            }
        }));

        let mut response = (self.status, body).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::InvalidCredential => {
                AppError::unauthorized("invalid_api_key", "Invalid API key.")
            }
            ServiceError::FileTooLarge { limit, .. } => AppError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "file_too_large",
                "file_size_exceeded",
                format!(
                    "File size exceeds the {} MB limit for your plan.",
                    limit / (1024 * 1024)
                ),
            ),
            ServiceError::QuotaExceeded { .. } => AppError::new(
                StatusCode::PAYMENT_REQUIRED,
                "storage_quota_exceeded",
                "quota_exceeded",
                "Storage quota exceeded. Delete files or upgrade your plan.",
            ),
            ServiceError::UnsupportedType => AppError::bad_request(
                "unsupported_file_type",
                "File type not supported. Allowed: jpg, png, gif, webp.",
            ),
            ServiceError::NotFound => AppError::new(
                StatusCode::NOT_FOUND,
                "not_found",
                "file_not_found",
                "File not found.",
            ),
            ServiceError::InvalidParameter(detail) => {
                AppError::bad_request("invalid_parameter", detail)
            }
            internal @ (ServiceError::Database(_) | ServiceError::Blob(_)) => {
                tracing::error!(error = %internal, "internal service error");
                AppError::internal("Internal error. Please try again.")
            }
        }
    }
}
