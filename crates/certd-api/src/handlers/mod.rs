//! HTTP handlers of the Gateway

pub mod acme;
pub mod crl;
pub mod health;
pub mod management;
pub mod ocsp;

use axum::{http::StatusCode, Json};
use certd_control::{ErrorKind, IssuanceError, QueueError};

use crate::models::ErrorResponse;

pub(crate) type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: Some(code.to_string()),
            retryable: status == StatusCode::SERVICE_UNAVAILABLE,
        }),
    )
}

impl From<IssuanceError> for ErrorResponse {
    fn from(err: IssuanceError) -> Self {
        Self {
            retryable: err.is_retryable(),
            code: Some(err.kind().as_str().to_uppercase()),
            error: err.to_string(),
        }
    }
}

pub(crate) fn issuance_error(err: IssuanceError) -> ApiError {
    let status = match err.kind() {
        ErrorKind::PolicyViolation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyRevoked | ErrorKind::InvalidTransition => StatusCode::CONFLICT,
        ErrorKind::TransientDependency | ErrorKind::KeyUnavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::DataConsistency | ErrorKind::ExhaustedRetries | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(ErrorResponse::from(err)))
}

pub(crate) fn queue_error(err: QueueError) -> ApiError {
    match err {
        QueueError::NotFound(id) => {
            api_error(StatusCode::NOT_FOUND, "NOT_FOUND", format!("{}: Job not found.", id))
        }
        other => api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "TRANSIENT_DEPENDENCY",
            other.to_string(),
        ),
    }
}
