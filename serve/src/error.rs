//! The error envelope: `{error: {code, message, trace_id}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use botweave::{ErrorCode, RuntimeError};
use serde_json::json;
use uuid::Uuid;

pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(what: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", format!("{what} not found"))
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }
}

/// Repository failures at the admin surface: outages are 503, anything else
/// is an internal error.
pub fn db_err(e: botweave::DbError) -> ApiError {
    match e {
        botweave::DbError::Unavailable(m) => RuntimeError::DbUnavailable(m).into(),
        botweave::DbError::Query(m) => RuntimeError::Internal(m).into(),
    }
}

impl From<RuntimeError> for ApiError {
    fn from(e: RuntimeError) -> Self {
        let status = match e.code() {
            ErrorCode::DbUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        // the envelope never carries implementation detail for internals
        let message = match e.code() {
            ErrorCode::Internal => "internal error".to_string(),
            _ => e.to_string(),
        };
        ApiError {
            status,
            code: e.code().as_str().to_string(),
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "trace_id": Uuid::new_v4().to_string(),
            }
        });
        (self.status, Json(body)).into_response()
    }
}
