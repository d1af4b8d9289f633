//! API error types and HTTP response conversion, grounded on `orca`'s
//! `api/error.rs` — a flat error enum with a status-code mapping and a
//! `serde`-able body, rather than leaking `FlowError`'s internal shape.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use flowgraph_core::error::{ErrorKind, FlowError};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error_kind: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> ErrorKind {
        match self {
            ApiError::NotFound(_) => ErrorKind::GraphStructure,
            ApiError::BadRequest(_) => ErrorKind::Validation,
            ApiError::Conflict(_) => ErrorKind::GraphStructure,
            ApiError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<FlowError> for ApiError {
    fn from(err: FlowError) -> Self {
        match err.kind() {
            ErrorKind::Validation => ApiError::BadRequest(err.message()),
            ErrorKind::GraphStructure => ApiError::BadRequest(err.message()),
            ErrorKind::InputMissing => ApiError::NotFound(err.message()),
            ErrorKind::Internal => ApiError::Internal(err.message()),
            _ => ApiError::BadRequest(err.message()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ApiErrorBody { error_kind: self.kind().to_string(), message: self.to_string() };
        tracing::warn!(status = %status, error = %body.message, "api error");
        (status, Json(body)).into_response()
    }
}
