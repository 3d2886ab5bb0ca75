use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Errors raised by configuration, storage and internal plumbing.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

/// JSON body carried by every response the guard produces on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub message: String,
}

/// Per-request outcomes where the guard answers instead of the handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardRejection {
    #[error("Idempotency key must be at least {min} characters.")]
    KeyTooShort { min: usize },

    #[error("A request with this idempotency key is already being processed.")]
    LockContention,

    #[error("Idempotency key already used with a different request body.")]
    FingerprintMismatch,

    #[error("Request body exceeds the {limit} byte limit for idempotent requests.")]
    BodyTooLarge { limit: usize },

    #[error("Idempotency store is unavailable, please retry.")]
    StoreUnavailable,
}

impl GuardRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            GuardRejection::KeyTooShort { .. } | GuardRejection::FingerprintMismatch => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            GuardRejection::LockContention => StatusCode::CONFLICT,
            GuardRejection::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GuardRejection::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GuardRejection::KeyTooShort { .. } => "key_too_short",
            GuardRejection::LockContention => "lock_contention",
            GuardRejection::FingerprintMismatch => "fingerprint_mismatch",
            GuardRejection::BodyTooLarge { .. } => "body_too_large",
            GuardRejection::StoreUnavailable => "store_unavailable",
        }
    }
}

impl IntoResponse for GuardRejection {
    fn into_response(self) -> Response {
        let body = MessageBody {
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
