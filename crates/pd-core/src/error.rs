//! Outcome type shared by every core component.
//!
//! Components return `Result<T, CoreError>`; the transport maps the stable
//! machine-readable code to an HTTP status and flattens `details` into the
//! response body so callers can see the conflicting holder or limit.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Stable error codes surfaced on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    IdentityInvalid,
    ValidationError,
    ServiceNotFound,
    PortExhausted,
    LockHeld,
    LockNotFound,
    InvalidTtl,
    InvalidEvent,
    AgentIdInvalid,
    SessionNotFound,
    FileConflict,
    Timeout,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::IdentityInvalid => "IDENTITY_INVALID",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::ServiceNotFound => "SERVICE_NOT_FOUND",
            ErrorCode::PortExhausted => "PORT_EXHAUSTED",
            ErrorCode::LockHeld => "LOCK_HELD",
            ErrorCode::LockNotFound => "LOCK_NOT_FOUND",
            ErrorCode::InvalidTtl => "INVALID_TTL",
            ErrorCode::InvalidEvent => "INVALID_EVENT",
            ErrorCode::AgentIdInvalid => "AGENT_ID_INVALID",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::FileConflict => "FILE_CONFLICT",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// A failed core operation: code, human message, optional structured extras
/// (conflicting holder, current/max counts, partial wait progress).
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CoreError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Value>,
}

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(error: sqlx::Error) -> Self {
        Self::internal(format!("store error: {error}"))
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(error: anyhow::Error) -> Self {
        Self::internal(format!("{error:#}"))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
