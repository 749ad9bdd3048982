//! Maps [`EngineError`] onto HTTP status codes for the route handlers.
//! Grounded on the teacher's `grpc.rs::engine_err`/`Status::invalid_argument`
//! convention, adapted from tonic `Status` to axum's `IntoResponse`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bpmn_engine_core::EngineError;
use serde::Serialize;

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub error_code: String,
}

pub struct AppError(pub EngineError);

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::InstanceNotFound(_) | EngineError::ElementNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::GraphInvalid(_) | EngineError::NoMatchingFlow { .. } => StatusCode::BAD_REQUEST,
            EngineError::ConditionEvaluation { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody { error: self.0.to_string(), error_code: self.0.error_code() };
        (status, Json(body)).into_response()
    }
}

/// Ad-hoc 400/404 errors that do not originate from the engine (bad JSON
/// shape, unknown instance id format, ...).
pub struct BadRequest(pub String);

impl IntoResponse for BadRequest {
    fn into_response(self) -> Response {
        let body = ErrorBody { error: self.0, error_code: "BadRequest".to_string() };
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}

/// Unifies the two error shapes a single handler can return: a malformed
/// request (caught before the engine is ever called) or an `EngineError`
/// surfaced from it.
pub enum HandlerError {
    Bad(BadRequest),
    Engine(AppError),
}

impl From<BadRequest> for HandlerError {
    fn from(e: BadRequest) -> Self {
        HandlerError::Bad(e)
    }
}

impl From<EngineError> for HandlerError {
    fn from(e: EngineError) -> Self {
        HandlerError::Engine(AppError(e))
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        match self {
            HandlerError::Bad(e) => e.into_response(),
            HandlerError::Engine(e) => e.into_response(),
        }
    }
}
