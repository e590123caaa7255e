use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::config;
use crate::errors::AppResult;
use crate::uploader::quota::{LedgerStore, QuotaLedger};
use crate::uploader::session::{SessionKey, SessionStore, UploadSession};

const DATABASE_FILE: &str = "tubecast.db";

/// One row of the upload history table.
#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub file_path: String,
    pub file_name: String,
    pub file_hash: Option<String>,
    pub file_size: Option<u64>,
    pub video_id: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub uploaded_at: Option<DateTime<Utc>>,
}

/// SQLite-backed state: resumable sessions, the quota ledger and upload history.
///
/// Every write is a single statement, so each snapshot lands atomically.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open_default() -> AppResult<Self> {
        let data_dir = config::get_data_directory()?;
        log::info!("Database directory: {}", data_dir.display());
        Self::open(&data_dir.join(DATABASE_FILE)).await
    }

    pub async fn open(db_path: &Path) -> AppResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn open_in_memory() -> AppResult<Self> {
        // A single connection, otherwise every pooled connection gets its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> AppResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS upload_sessions (
                file_path TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                session_url TEXT,
                total_size INTEGER NOT NULL,
                bytes_confirmed INTEGER NOT NULL DEFAULT 0,
                chunk_size INTEGER NOT NULL,
                status TEXT NOT NULL,
                last_error TEXT,
                remote_id TEXT,
                updated_at DATETIME NOT NULL,
                PRIMARY KEY (file_path, content_hash)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quota_ledger (
                day DATE PRIMARY KEY,
                consumed INTEGER NOT NULL,
                budget INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS upload_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_path TEXT NOT NULL,
                file_name TEXT NOT NULL,
                file_hash TEXT,
                file_size INTEGER,
                video_id TEXT,
                upload_status TEXT NOT NULL DEFAULT 'success',
                error_message TEXT,
                uploaded_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Two live sessions must never share a remote identifier.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_upload_sessions_url ON upload_sessions(session_url)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_upload_history_date ON upload_history(uploaded_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_upload_history_status ON upload_history(upload_status)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_upload(&self, record: &UploadRecord) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO upload_history
            (file_path, file_name, file_hash, file_size, video_id, upload_status, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.file_path)
        .bind(&record.file_name)
        .bind(&record.file_hash)
        .bind(record.file_size.map(|s| s as i64))
        .bind(&record.video_id)
        .bind(&record.status)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn recent_uploads(&self, limit: u32) -> AppResult<Vec<UploadRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT file_path, file_name, file_hash, file_size, video_id, upload_status,
                   error_message, uploaded_at
            FROM upload_history ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(UploadRecord {
                file_path: row.try_get("file_path")?,
                file_name: row.try_get("file_name")?,
                file_hash: row.try_get("file_hash")?,
                file_size: row.try_get::<Option<i64>, _>("file_size")?.map(|s| s as u64),
                video_id: row.try_get("video_id")?,
                status: row.try_get("upload_status")?,
                error_message: row.try_get("error_message")?,
                uploaded_at: row.try_get("uploaded_at")?,
            });
        }
        Ok(records)
    }

    pub async fn cleanup_old_upload_history(&self, days: i32) -> AppResult<u64> {
        let result = sqlx::query(
            "DELETE FROM upload_history WHERE uploaded_at < datetime('now', '-' || ? || ' days')",
        )
        .bind(days)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> AppResult<UploadSession> {
    let status: String = row.try_get("status")?;
    Ok(UploadSession {
        key: SessionKey {
            file_path: row.try_get("file_path")?,
            content_hash: row.try_get("content_hash")?,
        },
        session_url: row.try_get("session_url")?,
        total_size: row.try_get::<i64, _>("total_size")? as u64,
        bytes_confirmed: row.try_get::<i64, _>("bytes_confirmed")? as u64,
        chunk_size: row.try_get::<i64, _>("chunk_size")? as u64,
        status: status.parse()?,
        last_error: row.try_get("last_error")?,
        remote_id: row.try_get("remote_id")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn load_session(&self, key: &SessionKey) -> AppResult<Option<UploadSession>> {
        let row = sqlx::query(
            "SELECT * FROM upload_sessions WHERE file_path = ? AND content_hash = ?",
        )
        .bind(&key.file_path)
        .bind(&key.content_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(session_from_row).transpose()
    }

    async fn save_session(&self, session: &UploadSession) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO upload_sessions
            (file_path, content_hash, session_url, total_size, bytes_confirmed, chunk_size,
             status, last_error, remote_id, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (file_path, content_hash) DO UPDATE SET
                session_url = excluded.session_url,
                total_size = excluded.total_size,
                bytes_confirmed = excluded.bytes_confirmed,
                chunk_size = excluded.chunk_size,
                status = excluded.status,
                last_error = excluded.last_error,
                remote_id = excluded.remote_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&session.key.file_path)
        .bind(&session.key.content_hash)
        .bind(&session.session_url)
        .bind(session.total_size as i64)
        .bind(session.bytes_confirmed as i64)
        .bind(session.chunk_size as i64)
        .bind(session.status.as_str())
        .bind(&session.last_error)
        .bind(&session.remote_id)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn discard_session(&self, key: &SessionKey) -> AppResult<()> {
        sqlx::query("DELETE FROM upload_sessions WHERE file_path = ? AND content_hash = ?")
            .bind(&key.file_path)
            .bind(&key.content_hash)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_sessions(&self) -> AppResult<Vec<UploadSession>> {
        let rows = sqlx::query("SELECT * FROM upload_sessions ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(session_from_row).collect()
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn load_ledger(&self, day: NaiveDate) -> AppResult<Option<QuotaLedger>> {
        let row = sqlx::query("SELECT day, consumed, budget FROM quota_ledger WHERE day = ?")
            .bind(day)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(QuotaLedger {
                day: row.try_get("day")?,
                consumed: row.try_get::<i64, _>("consumed")? as u32,
                budget: row.try_get::<i64, _>("budget")? as u32,
            })),
            None => Ok(None),
        }
    }

    async fn save_ledger(&self, ledger: &QuotaLedger) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO quota_ledger (day, consumed, budget) VALUES (?, ?, ?)
            ON CONFLICT (day) DO UPDATE SET consumed = excluded.consumed, budget = excluded.budget
            "#,
        )
        .bind(ledger.day)
        .bind(ledger.consumed as i64)
        .bind(ledger.budget as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
