//! Error-to-status mapping for the HTTP surface.
//!
//! Validation failures are the client's problem (400 with a typed detail);
//! missing resources are 404; everything else is an infrastructure 500 whose
//! detail stays in the logs. Conflicts are resolved inside the ingest
//! handler and never reach this type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use rsk_schemas::{ErrorBody, ValidationError};

#[derive(Debug)]
pub enum ApiError {
    Validation(ValidationError),
    NotFound(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::Validation(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::Validation(err) => {
                (StatusCode::BAD_REQUEST, format!("Invalid event: {err}"))
            }
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            ApiError::Internal(err) => {
                error!(error = ?err, "internal error on request path");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorBody { detail })).into_response()
    }
}
