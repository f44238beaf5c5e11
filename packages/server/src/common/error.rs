//! Application error taxonomy and its HTTP mapping.
//!
//! The core stays transport-agnostic; this is the single place where engine
//! and domain failures become status codes. Post-commit action failures
//! never reach here — they live in the transition log.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ratchet::EngineError;
use thiserror::Error;
use tracing::error;

use super::envelope::Envelope;

#[derive(Debug, Error)]
pub enum AppError {
    /// Argument validation failure at the boundary.
    #[error("{0}")]
    InvalidInput(String),

    /// Entity, machine, or rule does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The current state does not permit the operation; prerequisites unmet;
    /// BOM in the wrong status.
    #[error("{0}")]
    PreconditionFailed(String),

    /// A firing found no transition row, or every guard evaluated false.
    #[error("{0}")]
    NoMatchingTransition(String),

    /// Retry budget exhausted on lock contention or unique-constraint races.
    #[error("{0}")]
    Conflict(String),

    /// The request's context was cancelled before commit. Retryable.
    #[error("operation cancelled")]
    Cancelled,

    /// Storage failure or invariant violation.
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl AppError {
    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        AppError::Internal(err.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::PreconditionFailed(_) => StatusCode::BAD_REQUEST,
            AppError::NoMatchingTransition(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NoMatchingTransition { .. } => {
                AppError::NoMatchingTransition(err.to_string())
            }
            EngineError::UnknownMachine { .. } => AppError::Internal(err.into()),
            EngineError::InvalidDefinition { .. } => AppError::Internal(err.into()),
            EngineError::MalformedPredicate(_) => AppError::Internal(err.into()),
            EngineError::Conflict(msg) => AppError::Conflict(msg),
            EngineError::Cancelled => AppError::Cancelled,
            EngineError::Storage(e) => AppError::Internal(e),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound("record not found".to_string()),
            other => AppError::Internal(other.into()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Internal detail stays in the log, not the response body.
        let message = match &self {
            AppError::Internal(source) => {
                error!(error = ?source, "internal error");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        let body = Envelope::<()> {
            code: status.as_u16() as i32,
            message,
            data: None,
        };
        (status, Json(body)).into_response()
    }
}
