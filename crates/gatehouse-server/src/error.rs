//! HTTP error responses.
//!
//! Every failure leaves the service as `{"error": <code>, "message": <text>}`
//! with a status derived from the error kind.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use gatehouse_pdp::{ErrorCategory, PdpError};
use serde_json::json;

/// Errors returned by route handlers and guards.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Pdp(#[from] PdpError),

    /// The request body could not be read as the expected JSON.
    #[error("{0}")]
    BadRequest(String),

    /// A required credential header is missing or wrong.
    #[error("{0}")]
    Unauthorized(String),
}

impl ApiError {
    /// Returns (HTTP status, error code).
    fn details(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Pdp(err) => match err.category() {
                ErrorCategory::Validation => (StatusCode::BAD_REQUEST, "validation_error"),
                ErrorCategory::PolicyLoad => (StatusCode::SERVICE_UNAVAILABLE, "policy_load_error"),
                ErrorCategory::PolicyEvaluation => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "policy_evaluation_error")
                }
            },
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.details();
        let message = self.to_string();
        let retryable = matches!(&self, Self::Pdp(err) if err.is_retryable());

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = code, retryable, %message, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = code, %message, "Request rejected");
        }

        (status, Json(json!({ "error": code, "message": message }))).into_response()
    }
}
