//! Error taxonomy for the replay engine and its control surface.
//!
//! `EngineError` covers the categories the core can fail with; `ApiError` maps
//! those (plus request-shape errors) onto the HTTP boundary.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("replay not found: {0}")]
    NotFound(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("could not parse detector input: {0}")]
    DetectorParse(String),

    #[error("checkpoint store error: {0}")]
    Checkpoint(String),
}

impl EngineError {
    /// Label used for the `error_type` metrics dimension.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::Transport(_) => "transport",
            EngineError::NotFound(_) => "not_found",
            EngineError::InvariantViolation(_) => "invariant_violation",
            EngineError::DetectorParse(_) => "detector_parse",
            EngineError::Checkpoint(_) => "checkpoint",
        }
    }

    /// Transport and checkpoint errors are handled inline (logged, counted,
    /// the run continues); anything else escaping the replay loop is fatal.
    pub fn is_fatal_to_run(&self) -> bool {
        !matches!(self, EngineError::Transport(_) | EngineError::Checkpoint(_))
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug)]
pub enum ApiError {
    NotFound { message: String },
    BadRequest { message: String },
    Unauthorized,
    Internal { message: String },
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound { .. } => "not_found",
            ApiError::BadRequest { .. } => "bad_request",
            ApiError::Unauthorized => "unauthorized",
            ApiError::Internal { .. } => "internal_error",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::NotFound { message }
            | ApiError::BadRequest { message }
            | ApiError::Internal { message } => message.clone(),
            ApiError::Unauthorized => "missing or invalid bearer token".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.message(),
                details: None,
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(message) => ApiError::NotFound { message },
            EngineError::Config(message) | EngineError::InvariantViolation(message) => {
                ApiError::Internal { message }
            }
            EngineError::Transport(message)
            | EngineError::Checkpoint(message)
            | EngineError::DetectorParse(message) => ApiError::BadRequest { message },
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let err = ApiError::NotFound {
            message: "replay r-abc123 not found".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn engine_not_found_converts_to_api_not_found() {
        let err: ApiError = EngineError::NotFound("r-abc123".to_string()).into();
        assert!(matches!(err, ApiError::NotFound { .. }));
    }

    #[test]
    fn transport_error_is_not_fatal_to_run() {
        let err = EngineError::Transport("timeout".to_string());
        assert!(!err.is_fatal_to_run());
    }

    #[test]
    fn invariant_violation_is_fatal_to_run() {
        let err = EngineError::InvariantViolation("events_processed > total_events".to_string());
        assert!(err.is_fatal_to_run());
    }
}
