//! Error responses for the status API.
//!
//! Every failure is rendered as `{"error": "<message>"}` with the mapped
//! status code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    /// A cycle is already in flight.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The endpoint needs a component this server was started without.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::NotFound(msg) | ApiError::Conflict(msg) | ApiError::Unavailable(msg) => msg,
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
