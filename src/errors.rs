use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid file type: {path}. Only video files are supported.")]
    InvalidFileType { path: String },

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Rate limit exceeded. Retry after {retry_after_ms}ms")]
    RateLimit { retry_after_ms: u64 },

    #[error("Authentication rejected: {message}")]
    Auth { message: String },

    #[error("Request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Daily quota exceeded ({message}); resets at {resets_at}")]
    QuotaExceeded {
        message: String,
        resets_at: DateTime<Utc>,
    },

    #[error("Upload session cannot be resumed (local offset {local}, remote offset {remote:?})")]
    ResumeMismatch { local: u64, remote: Option<u64> },

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<AppError> },

    #[error("Upload cancelled during {phase}")]
    Cancelled { phase: String },

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Metadata generation failed: {0}")]
    Generation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Custom result type
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(field: &str, message: &str) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    pub fn file_not_found(path: &str) -> Self {
        Self::FileNotFound {
            path: path.to_string(),
        }
    }

    pub fn invalid_file_type(path: &str) -> Self {
        Self::InvalidFileType {
            path: path.to_string(),
        }
    }

    pub fn cancelled(phase: &str) -> Self {
        Self::Cancelled {
            phase: phase.to_string(),
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Transient failures worth another attempt: timeouts, resets, 5xx and 429.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Network(e) => !e.is_builder() && !e.is_decode(),
            AppError::Server { .. } | AppError::RateLimit { .. } => true,
            AppError::Io(e) => matches!(
                e.kind(),
                ErrorKind::TimedOut
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::Interrupted
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            AppError::FileNotFound { .. }
                | AppError::InvalidFileType { .. }
                | AppError::Validation { .. }
                | AppError::Auth { .. }
                | AppError::Rejected { .. }
                | AppError::QuotaExceeded { .. }
                | AppError::ResumeMismatch { .. }
                | AppError::RetriesExhausted { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled { .. })
    }

    /// Backoff hint carried by a 429 response, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            AppError::RateLimit { retry_after_ms } if *retry_after_ms > 0 => Some(*retry_after_ms),
            _ => None,
        }
    }
}
