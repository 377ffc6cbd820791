//! Error responses for the operational endpoints.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// JSON error body returned by every failing endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error_code: &'static str,
    pub error_message: String,
    #[serde(skip)]
    status: StatusCode,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

/// Failures of the scheduler endpoints.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configured shared secret was missing or wrong.
    #[error("missing or invalid scheduler credentials")]
    Unauthorized,

    /// The dedup-insert statement failed.
    #[error("failed to enqueue fresh runs: {0}")]
    Schedule(#[source] sqlx::Error),
}

impl Error {
    fn error_code(&self) -> &'static str {
        match self {
            Error::Unauthorized => "UNAUTHORIZED",
            Error::Schedule(_) => "SCHEDULE_DB_ERROR",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Schedule(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ErrorResponse {
    fn from(err: Error) -> Self {
        ErrorResponse {
            error_code: err.error_code(),
            error_message: err.to_string(),
            status: err.status_code(),
        }
    }
}
