//! API error types with HTTP response mapping.
//!
//! Every error body carries a stable `code` and a client-facing `error`
//! message. Internal error text is logged, never returned.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use domain::{TransitionError, ValidationErrors};
use processing::ProcessingError;
use repository::RepositoryError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Bad request from the client.
    BadRequest(String),
    /// One or more request fields failed validation.
    Validation(ValidationErrors),
    /// Payment processing error.
    Processing(ProcessingError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Validation(errors)
            | ApiError::Processing(ProcessingError::Validation(errors)) => {
                return validation_response(&errors);
            }
            ApiError::Processing(err) => processing_error_to_response(err),
        };

        let body = serde_json::json!({ "error": message, "code": code });
        (status, axum::Json(body)).into_response()
    }
}

fn validation_response(errors: &ValidationErrors) -> Response {
    let body = serde_json::json!({
        "error": "Validation failed",
        "code": "VALIDATION_FAILED",
        "violations": errors.violations(),
    });
    (StatusCode::UNPROCESSABLE_ENTITY, axum::Json(body)).into_response()
}

fn processing_error_to_response(err: ProcessingError) -> (StatusCode, &'static str, String) {
    match &err {
        ProcessingError::Transition(TransitionError::InvalidTransition { from, to, .. }) => (
            StatusCode::CONFLICT,
            "INVALID_TRANSITION",
            format!("Payment in status {from} cannot move to {to}"),
        ),
        ProcessingError::Repository(RepositoryError::NotFound { entity, .. }) => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("{entity} not found"),
        ),
        ProcessingError::Repository(RepositoryError::ConcurrencyConflict { .. }) => (
            StatusCode::CONFLICT,
            "CONCURRENT_UPDATE",
            "Payment was updated by another request".to_string(),
        ),
        ProcessingError::Repository(RepositoryError::OrderAlreadyPaid { .. }) => (
            StatusCode::CONFLICT,
            "ORDER_ALREADY_PAID",
            "Order already has a completed payment".to_string(),
        ),
        ProcessingError::QueueClosed => (
            StatusCode::SERVICE_UNAVAILABLE,
            "QUEUE_CLOSED",
            "Payment queue is not accepting work".to_string(),
        ),
        _ => {
            tracing::error!(error = %err, "internal server error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error".to_string(),
            )
        }
    }
}

impl From<ProcessingError> for ApiError {
    fn from(err: ProcessingError) -> Self {
        ApiError::Processing(err)
    }
}

impl From<ValidationErrors> for ApiError {
    fn from(err: ValidationErrors) -> Self {
        ApiError::Validation(err)
    }
}
