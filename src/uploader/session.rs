use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "in_progress" => Ok(SessionStatus::InProgress),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            other => Err(AppError::Internal(format!("Unknown session status '{}'", other))),
        }
    }
}

/// Identifies the upload of one particular file content at one path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub file_path: String,
    pub content_hash: String,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = &self.content_hash[..self.content_hash.len().min(12)];
        write!(f, "{}@{}", self.file_path, short)
    }
}

/// State of one file's resumable upload.
///
/// `bytes_confirmed` only moves forward while streaming; the one exception is
/// [`UploadSession::reconcile`], which adopts the server's view on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub key: SessionKey,
    pub session_url: Option<String>,
    pub total_size: u64,
    pub bytes_confirmed: u64,
    pub chunk_size: u64,
    pub status: SessionStatus,
    pub last_error: Option<String>,
    pub remote_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(key: SessionKey, total_size: u64, chunk_size: u64) -> Self {
        Self {
            key,
            session_url: None,
            total_size,
            bytes_confirmed: 0,
            chunk_size,
            status: SessionStatus::Pending,
            last_error: None,
            remote_id: None,
            updated_at: Utc::now(),
        }
    }

    /// Builds a fresh in-progress session from a persisted snapshot that still
    /// carries a remote session URL. The snapshot itself is left untouched.
    pub fn revive(snapshot: &UploadSession, chunk_size: u64) -> Option<Self> {
        if snapshot.status == SessionStatus::Completed {
            return None;
        }
        let url = snapshot.session_url.clone()?;
        Some(Self {
            key: snapshot.key.clone(),
            session_url: Some(url),
            total_size: snapshot.total_size,
            bytes_confirmed: snapshot.bytes_confirmed.min(snapshot.total_size),
            chunk_size,
            status: SessionStatus::InProgress,
            last_error: None,
            remote_id: None,
            updated_at: Utc::now(),
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn remaining(&self) -> u64 {
        self.total_size - self.bytes_confirmed
    }

    pub fn progress_percent(&self) -> f32 {
        if self.total_size == 0 {
            return 100.0;
        }
        (self.bytes_confirmed as f64 / self.total_size as f64 * 100.0) as f32
    }

    fn ensure_open(&self, target: SessionStatus) -> AppResult<()> {
        if self.is_terminal() {
            return Err(AppError::invalid_transition(self.status, target));
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Pending -> InProgress once the remote session exists.
    pub fn begin(&mut self, session_url: String) -> AppResult<()> {
        if self.status != SessionStatus::Pending {
            return Err(AppError::invalid_transition(
                self.status,
                SessionStatus::InProgress,
            ));
        }
        self.session_url = Some(session_url);
        self.status = SessionStatus::InProgress;
        self.touch();
        Ok(())
    }

    /// Records the server-confirmed offset after a chunk.
    pub fn confirm(&mut self, confirmed: u64) -> AppResult<()> {
        if self.status != SessionStatus::InProgress {
            return Err(AppError::invalid_transition(
                self.status,
                SessionStatus::InProgress,
            ));
        }
        if confirmed > self.total_size || confirmed < self.bytes_confirmed {
            return Err(AppError::ResumeMismatch {
                local: self.bytes_confirmed,
                remote: Some(confirmed),
            });
        }
        self.bytes_confirmed = confirmed;
        self.touch();
        Ok(())
    }

    /// Adopts the server offset after an interruption. Offsets more than one
    /// chunk apart are treated as irreconcilable.
    pub fn reconcile(&mut self, remote: u64) -> AppResult<()> {
        self.ensure_open(SessionStatus::InProgress)?;
        if remote > self.total_size || self.bytes_confirmed.abs_diff(remote) > self.chunk_size {
            return Err(AppError::ResumeMismatch {
                local: self.bytes_confirmed,
                remote: Some(remote),
            });
        }
        if remote != self.bytes_confirmed {
            log::info!(
                "Reconciled {} from local offset {} to server offset {}",
                self.key,
                self.bytes_confirmed,
                remote
            );
        }
        self.bytes_confirmed = remote;
        self.touch();
        Ok(())
    }

    pub fn complete(&mut self, remote_id: String) -> AppResult<()> {
        if self.status != SessionStatus::InProgress {
            return Err(AppError::invalid_transition(
                self.status,
                SessionStatus::Completed,
            ));
        }
        self.bytes_confirmed = self.total_size;
        self.remote_id = Some(remote_id);
        self.status = SessionStatus::Completed;
        self.touch();
        Ok(())
    }

    pub fn fail(&mut self, error: &AppError) -> AppResult<()> {
        self.ensure_open(SessionStatus::Failed)?;
        self.last_error = Some(error.to_string());
        self.status = SessionStatus::Failed;
        self.touch();
        Ok(())
    }

    pub fn cancel(&mut self) -> AppResult<()> {
        self.ensure_open(SessionStatus::Cancelled)?;
        self.status = SessionStatus::Cancelled;
        self.touch();
        Ok(())
    }
}

/// Durable storage of session snapshots, one per [`SessionKey`].
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self, key: &SessionKey) -> AppResult<Option<UploadSession>>;
    async fn save_session(&self, session: &UploadSession) -> AppResult<()>;
    async fn discard_session(&self, key: &SessionKey) -> AppResult<()>;
    async fn list_sessions(&self) -> AppResult<Vec<UploadSession>>;
}
