use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Startup-time configuration failures. Never produced on the request path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("policy '{label}': {reason}")]
    InvalidPolicy { label: String, reason: String },

    #[error("duplicate policy label '{0}'")]
    DuplicatePolicy(String),

    #[error("invalid identity template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("invalid breaker setting: {0}")]
    InvalidBreaker(String),

    #[error("{0}")]
    Invalid(String),

    #[error("failed to load policy file: {0}")]
    PolicyFile(String),
}

/// Failures talking to a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Errors that mean the connection itself is gone, as opposed to a bad reply.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Redis(err) => {
                err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal()
            }
            StoreError::Protocol(_) => false,
        }
    }
}

/// Outcome of a call guarded by the circuit breaker.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit open")]
    Open,

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("dependency reported unavailable")]
    Unavailable,

    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BreakerError::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no policy registered for label '{0}'")]
    UnknownPolicy(String),

    #[error("identity key must not be empty")]
    InvalidIdentity,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_error(err: &Error) -> Self {
        let message = err.to_string();
        match err {
            Error::Validation(_) | Error::InvalidIdentity => {
                Self::new("validation_error", &message, 422)
            }
            Error::UnknownPolicy(_) => Self::new("unknown_policy", &message, 404),
            Error::Store(_) => Self::new("service_unavailable", &message, 503),
            Error::Config(_) => Self::new("configuration_error", &message, 500),
            Error::Io(_) => Self::new("internal_error", &message, 500),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(error = %self, http_status = %status, "request failed");
        } else {
            tracing::warn!(error = %self, http_status = %status, "request rejected");
        }

        (status, Json(body)).into_response()
    }
}
