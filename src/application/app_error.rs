use thiserror::Error;

use crate::domain::entities::billing_event::EventParseError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Payload too large")]
    PayloadTooLarge,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found")]
    NotFound,

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Clone, Copy, Debug)]
pub enum ErrorCode {
    DatabaseError,
    InvalidSignature,
    InvalidInput,
    PayloadTooLarge,
    Unauthorized,
    Conflict,
    NotFound,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::InvalidSignature => "INVALID_SIGNATURE",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<EventParseError> for AppError {
    fn from(err: EventParseError) -> Self {
        AppError::InvalidInput(err.to_string())
    }
}

/// Failure of an event handler, split by whether trying again can help.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// Store unavailable, timeout, lost connection. Goes to the retry queue.
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying cannot succeed. Goes straight to the dead letter store.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl From<AppError> for ProcessingError {
    fn from(err: AppError) -> Self {
        match err {
            // Transient errors - retry may succeed
            AppError::Database(_) | AppError::Internal(_) => {
                ProcessingError::Transient(err.to_string())
            }

            // Expected conditions - won't change with retry
            AppError::InvalidSignature(_)
            | AppError::InvalidInput(_)
            | AppError::PayloadTooLarge
            | AppError::Unauthorized
            | AppError::Conflict(_)
            | AppError::NotFound => ProcessingError::Permanent(err.to_string()),
        }
    }
}
