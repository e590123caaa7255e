// Drives one resumable upload session from first byte to remote video id.
//
// The server is authoritative for how many bytes it holds: every response
// carries the confirmed offset and the next chunk always starts there.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;

use crate::errors::{AppError, AppResult};
use crate::media::MediaItem;
use crate::metadata::Metadata;

use super::progress_tracker::UploadObserver;
use super::retry::RetryPolicy;
use super::session::{SessionKey, SessionStatus, SessionStore, UploadSession};

/// What the server said after receiving bytes or a status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkResponse {
    /// The server holds bytes `[0, confirmed)`.
    Accepted { confirmed: u64 },
    /// Nothing was taken; ask for the session status before sending more.
    StatusRequested,
    /// Upload finished and the remote resource exists.
    Complete { remote_id: String },
}

/// Remote side of the resumable upload protocol.
#[async_trait]
pub trait ResumableEndpoint: Send + Sync {
    /// Creates a remote session and returns its URL.
    async fn initiate(
        &self,
        metadata: &Metadata,
        total_size: u64,
        content_type: &str,
    ) -> AppResult<String>;

    async fn send_chunk(
        &self,
        session_url: &str,
        offset: u64,
        total_size: u64,
        bytes: &[u8],
    ) -> AppResult<ChunkResponse>;

    async fn query_status(&self, session_url: &str, total_size: u64) -> AppResult<ChunkResponse>;
}

pub struct ChunkedTransport {
    endpoint: Arc<dyn ResumableEndpoint>,
    store: Arc<dyn SessionStore>,
    retry: RetryPolicy,
    chunk_size: u64,
}

impl ChunkedTransport {
    pub fn new(
        endpoint: Arc<dyn ResumableEndpoint>,
        store: Arc<dyn SessionStore>,
        retry: RetryPolicy,
        chunk_size: u64,
    ) -> Self {
        Self {
            endpoint,
            store,
            retry,
            chunk_size,
        }
    }

    fn session_url(session: &UploadSession) -> AppResult<String> {
        session
            .session_url
            .clone()
            .ok_or_else(|| AppError::Internal(format!("Session {} has no URL", session.key)))
    }

    /// Opens the remote session. Pending -> InProgress.
    pub async fn initiate(
        &self,
        session: &mut UploadSession,
        metadata: &Metadata,
        content_type: &str,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        let total_size = session.total_size;
        let url = self
            .retry
            .execute(
                || self.endpoint.initiate(metadata, total_size, content_type),
                cancel,
            )
            .await?;

        log::info!("Opened upload session for {}", session.key);
        session.begin(url)?;
        self.store.save_session(session).await
    }

    /// Sends `bytes` starting at `offset` and records what the server confirmed.
    /// Returns the confirmed offset.
    pub async fn send_chunk(
        &self,
        session: &mut UploadSession,
        offset: u64,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> AppResult<u64> {
        let url = Self::session_url(session)?;
        let total_size = session.total_size;
        let response = self
            .retry
            .execute(
                || self.endpoint.send_chunk(&url, offset, total_size, bytes),
                cancel,
            )
            .await?;

        let expected = offset + bytes.len() as u64;
        match response {
            ChunkResponse::Accepted { confirmed } => {
                if confirmed < expected {
                    log::debug!(
                        "Partial acceptance for {}: server holds {} of {} bytes sent so far",
                        session.key,
                        confirmed,
                        expected
                    );
                }
                session.confirm(confirmed)?;
            }
            ChunkResponse::Complete { remote_id } => {
                session.confirm(total_size)?;
                session.remote_id = Some(remote_id);
            }
            ChunkResponse::StatusRequested => {
                log::debug!("Server asked for a status check on {}", session.key);
                self.resume(session, cancel).await?;
                return Ok(session.bytes_confirmed);
            }
        }

        self.store.save_session(session).await?;
        Ok(session.bytes_confirmed)
    }

    /// Re-reads the server offset of an existing session and adopts it.
    pub async fn resume(
        &self,
        session: &mut UploadSession,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        let url = Self::session_url(session)?;
        let total_size = session.total_size;
        let response = self
            .retry
            .execute(|| self.endpoint.query_status(&url, total_size), cancel)
            .await?;

        match response {
            ChunkResponse::Accepted { confirmed } => session.reconcile(confirmed)?,
            ChunkResponse::Complete { remote_id } => {
                session.reconcile(total_size)?;
                session.remote_id = Some(remote_id);
            }
            ChunkResponse::StatusRequested => {
                return Err(AppError::ResumeMismatch {
                    local: session.bytes_confirmed,
                    remote: None,
                })
            }
        }

        self.store.save_session(session).await
    }

    /// Completes the session once every byte is confirmed. InProgress -> Completed.
    pub async fn finalize(
        &self,
        session: &mut UploadSession,
        cancel: &CancellationToken,
    ) -> AppResult<String> {
        if session.remote_id.is_none() {
            self.resume(session, cancel).await?;
        }

        let remote_id = match session.remote_id.clone() {
            Some(id) => id,
            None => {
                return Err(AppError::Internal(format!(
                    "Server has {} of {} bytes for {} but reported no video id",
                    session.bytes_confirmed, session.total_size, session.key
                )))
            }
        };

        session.complete(remote_id.clone())?;
        // Completed sessions are not resumable, so the record goes away.
        self.store.discard_session(&session.key).await?;
        Ok(remote_id)
    }

    /// Uploads `item`, resuming a stored session for the same key when one exists.
    pub async fn upload(
        &self,
        item: &MediaItem,
        metadata: &Metadata,
        key: SessionKey,
        cancel: &CancellationToken,
        observer: &dyn UploadObserver,
    ) -> AppResult<String> {
        let mut session = self.prepare_session(item, &key).await?;
        let mut restarted = false;

        loop {
            match self
                .drive(&mut session, item, metadata, cancel, observer)
                .await
            {
                Ok(remote_id) => return Ok(remote_id),
                Err(AppError::ResumeMismatch { local, remote }) if !restarted => {
                    log::warn!(
                        "Session for {} could not be reconciled (local {}, remote {:?}); restarting from zero",
                        item.path.display(),
                        local,
                        remote
                    );
                    observer.on_restart(item);
                    self.store.discard_session(&key).await?;
                    session = UploadSession::new(key.clone(), item.size, self.chunk_size);
                    restarted = true;
                }
                Err(error) => {
                    self.record_failure(&mut session, &error).await;
                    return Err(error);
                }
            }
        }
    }

    async fn prepare_session(&self, item: &MediaItem, key: &SessionKey) -> AppResult<UploadSession> {
        if let Some(snapshot) = self.store.load_session(key).await? {
            if snapshot.total_size == item.size {
                if let Some(revived) = UploadSession::revive(&snapshot, self.chunk_size) {
                    log::info!(
                        "Found resumable session for {} at {} of {} bytes ({})",
                        item.path.display(),
                        revived.bytes_confirmed,
                        revived.total_size,
                        snapshot.status
                    );
                    return Ok(revived);
                }
            }
            log::debug!("Discarding stale session record for {}", key);
            self.store.discard_session(key).await?;
        }
        Ok(UploadSession::new(key.clone(), item.size, self.chunk_size))
    }

    async fn drive(
        &self,
        session: &mut UploadSession,
        item: &MediaItem,
        metadata: &Metadata,
        cancel: &CancellationToken,
        observer: &dyn UploadObserver,
    ) -> AppResult<String> {
        match session.status {
            SessionStatus::Pending => {
                self.initiate(session, metadata, &item.content_type, cancel)
                    .await?
            }
            SessionStatus::InProgress => {
                self.resume(session, cancel).await?;
                observer.on_resumed(item, session.bytes_confirmed, session.total_size);
            }
            status => return Err(AppError::invalid_transition(status, SessionStatus::InProgress)),
        }

        let mut file = tokio::fs::File::open(&item.path).await?;
        observer.on_chunk_confirmed(session.bytes_confirmed, session.total_size);

        while session.remote_id.is_none() && session.bytes_confirmed < session.total_size {
            if cancel.is_cancelled() {
                return Err(AppError::cancelled("upload"));
            }

            let offset = session.bytes_confirmed;
            let len = self.chunk_size.min(session.total_size - offset);
            let chunk = read_chunk(&mut file, offset, len).await?;

            let confirmed = self.send_chunk(session, offset, &chunk, cancel).await?;
            log::debug!(
                "{}: {} / {} bytes confirmed",
                item.file_name(),
                confirmed,
                session.total_size
            );
            observer.on_chunk_confirmed(confirmed, session.total_size);
        }

        self.finalize(session, cancel).await
    }

    async fn record_failure(&self, session: &mut UploadSession, error: &AppError) {
        let transition = if error.is_cancelled() {
            session.cancel()
        } else {
            session.fail(error)
        };
        if let Err(e) = transition {
            log::debug!("Session {} already terminal: {}", session.key, e);
            return;
        }

        let persisted = match error {
            // Nothing left to resume against.
            AppError::ResumeMismatch { .. } => self.store.discard_session(&session.key).await,
            _ if session.session_url.is_none() => self.store.discard_session(&session.key).await,
            _ => self.store.save_session(session).await,
        };
        if let Err(e) = persisted {
            log::error!("Failed to persist session {}: {}", session.key, e);
        }
    }
}

async fn read_chunk(file: &mut tokio::fs::File, offset: u64, len: u64) -> AppResult<Vec<u8>> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqliteStore;
    use crate::metadata::{MetadataDefaults, Privacy, Tags};
    use crate::uploader::progress_tracker::NoopObserver;
    use crate::uploader::retry::RetryConfig;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    const CHUNK: u64 = 256 * 1024;

    /// In-memory server that keeps the bytes it accepted.
    #[derive(Default)]
    struct FakeServer {
        received: Mutex<Vec<u8>>,
        sent_ranges: Mutex<Vec<(u64, u64)>>,
        partial_once: Mutex<bool>,
        transient_failures: Mutex<u32>,
        sessions: Mutex<u32>,
        forget_session: Mutex<bool>,
    }

    #[async_trait]
    impl ResumableEndpoint for FakeServer {
        async fn initiate(&self, _: &Metadata, _: u64, _: &str) -> AppResult<String> {
            let mut sessions = self.sessions.lock().unwrap();
            *sessions += 1;
            self.received.lock().unwrap().clear();
            Ok(format!("https://upload.example/session/{}", *sessions))
        }

        async fn send_chunk(
            &self,
            _url: &str,
            offset: u64,
            total_size: u64,
            bytes: &[u8],
        ) -> AppResult<ChunkResponse> {
            {
                let mut failures = self.transient_failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(AppError::Server {
                        status: 503,
                        message: "try again".into(),
                    });
                }
            }
            self.sent_ranges
                .lock()
                .unwrap()
                .push((offset, offset + bytes.len() as u64));

            let mut received = self.received.lock().unwrap();
            assert_eq!(received.len() as u64, offset, "chunk must start at server offset");

            let mut take = bytes.len();
            let mut partial = self.partial_once.lock().unwrap();
            if *partial && bytes.len() > 1024 {
                take = bytes.len() / 2;
                *partial = false;
            }
            received.extend_from_slice(&bytes[..take]);

            if received.len() as u64 == total_size {
                Ok(ChunkResponse::Complete {
                    remote_id: "vid00000001".into(),
                })
            } else {
                Ok(ChunkResponse::Accepted {
                    confirmed: received.len() as u64,
                })
            }
        }

        async fn query_status(&self, _url: &str, total_size: u64) -> AppResult<ChunkResponse> {
            if *self.forget_session.lock().unwrap() {
                return Err(AppError::ResumeMismatch {
                    local: 0,
                    remote: None,
                });
            }
            let held = self.received.lock().unwrap().len() as u64;
            if held == total_size {
                Ok(ChunkResponse::Complete {
                    remote_id: "vid00000001".into(),
                })
            } else {
                Ok(ChunkResponse::Accepted { confirmed: held })
            }
        }
    }

    fn metadata() -> Metadata {
        Metadata {
            title: "Test".into(),
            description: String::new(),
            tags: Tags::default(),
            privacy: Privacy::Private,
            category: MetadataDefaults::default().category,
            made_for_kids: false,
            contains_synthetic_media: false,
        }
    }

    fn write_video(dir: &std::path::Path, size: usize) -> (MediaItem, Vec<u8>) {
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let path: PathBuf = dir.join("clip.mp4");
        std::fs::write(&path, &data).unwrap();
        (MediaItem::from_path(&path).unwrap(), data)
    }

    fn key(item: &MediaItem) -> SessionKey {
        SessionKey {
            file_path: item.path.to_string_lossy().to_string(),
            content_hash: "hash".into(),
        }
    }

    async fn transport(server: Arc<FakeServer>) -> (ChunkedTransport, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let retry = RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..RetryConfig::default()
        });
        (
            ChunkedTransport::new(server, store.clone(), retry, CHUNK),
            store,
        )
    }

    #[tokio::test]
    async fn test_streams_all_chunks_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let (item, data) = write_video(dir.path(), (CHUNK * 3 + 100) as usize);
        let server = Arc::new(FakeServer::default());
        let (transport, store) = transport(server.clone()).await;

        let id = transport
            .upload(&item, &metadata(), key(&item), &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap();

        assert_eq!(id, "vid00000001");
        assert_eq!(*server.received.lock().unwrap(), data);
        assert_eq!(server.sent_ranges.lock().unwrap().len(), 4);
        assert!(store.load_session(&key(&item)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_acceptance_resends_from_server_offset() {
        let dir = tempfile::tempdir().unwrap();
        let (item, data) = write_video(dir.path(), (CHUNK * 2) as usize);
        let server = Arc::new(FakeServer::default());
        *server.partial_once.lock().unwrap() = true;
        let (transport, _) = transport(server.clone()).await;

        transport
            .upload(&item, &metadata(), key(&item), &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap();

        assert_eq!(*server.received.lock().unwrap(), data);
        let ranges = server.sent_ranges.lock().unwrap().clone();
        assert_eq!(ranges[0], (0, CHUNK));
        assert_eq!(ranges[1].0, CHUNK / 2);
    }

    #[tokio::test]
    async fn test_transient_chunk_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let (item, data) = write_video(dir.path(), (CHUNK + 10) as usize);
        let server = Arc::new(FakeServer::default());
        *server.transient_failures.lock().unwrap() = 2;
        let (transport, _) = transport(server.clone()).await;

        transport
            .upload(&item, &metadata(), key(&item), &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(*server.received.lock().unwrap(), data);
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_resumable_record() {
        let dir = tempfile::tempdir().unwrap();
        let (item, _) = write_video(dir.path(), (CHUNK + 10) as usize);
        let server = Arc::new(FakeServer::default());
        *server.transient_failures.lock().unwrap() = 10;
        let (transport, store) = transport(server.clone()).await;

        let result = transport
            .upload(&item, &metadata(), key(&item), &CancellationToken::new(), &NoopObserver)
            .await;
        assert!(matches!(result, Err(AppError::RetriesExhausted { attempts: 3, .. })));

        let record = store.load_session(&key(&item)).await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Failed);
        assert!(record.session_url.is_some());
        assert!(record.last_error.is_some());
    }

    #[tokio::test]
    async fn test_resume_continues_from_server_offset() {
        let dir = tempfile::tempdir().unwrap();
        let (item, data) = write_video(dir.path(), (CHUNK * 4) as usize);
        let server = Arc::new(FakeServer::default());
        let (transport, store) = transport(server.clone()).await;

        // Simulate an earlier run: two chunks reached the server but only the
        // first confirmation was persisted before the process died.
        server.received.lock().unwrap().extend_from_slice(&data[..(CHUNK * 2) as usize]);
        let mut snapshot = UploadSession::new(key(&item), item.size, CHUNK);
        snapshot.begin("https://upload.example/session/old".into()).unwrap();
        snapshot.confirm(CHUNK).unwrap();
        store.save_session(&snapshot).await.unwrap();

        transport
            .upload(&item, &metadata(), key(&item), &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap();

        assert_eq!(*server.received.lock().unwrap(), data);
        let ranges = server.sent_ranges.lock().unwrap().clone();
        assert_eq!(ranges, vec![(CHUNK * 2, CHUNK * 3), (CHUNK * 3, CHUNK * 4)]);
        assert_eq!(*server.sessions.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_irreconcilable_session_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (item, data) = write_video(dir.path(), (CHUNK * 4) as usize);
        let server = Arc::new(FakeServer::default());
        let (transport, store) = transport(server.clone()).await;

        // Local record claims three chunks, server holds nothing.
        let mut snapshot = UploadSession::new(key(&item), item.size, CHUNK);
        snapshot.begin("https://upload.example/session/old".into()).unwrap();
        snapshot.confirm(CHUNK * 3).unwrap();
        store.save_session(&snapshot).await.unwrap();

        let id = transport
            .upload(&item, &metadata(), key(&item), &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap();

        assert_eq!(id, "vid00000001");
        assert_eq!(*server.sessions.lock().unwrap(), 1);
        assert_eq!(*server.received.lock().unwrap(), data);
        assert_eq!(server.sent_ranges.lock().unwrap()[0], (0, CHUNK));
    }

    #[tokio::test]
    async fn test_expired_session_restarts_once() {
        let dir = tempfile::tempdir().unwrap();
        let (item, _) = write_video(dir.path(), (CHUNK * 2) as usize);
        let server = Arc::new(FakeServer::default());
        *server.forget_session.lock().unwrap() = true;
        let (transport, store) = transport(server.clone()).await;

        let mut snapshot = UploadSession::new(key(&item), item.size, CHUNK);
        snapshot.begin("https://upload.example/session/gone".into()).unwrap();
        store.save_session(&snapshot).await.unwrap();

        transport
            .upload(&item, &metadata(), key(&item), &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(*server.sessions.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_confirmed_bytes_match_chunk_sum() {
        let dir = tempfile::tempdir().unwrap();
        let (item, _) = write_video(dir.path(), (CHUNK * 2 + 7) as usize);
        let server = Arc::new(FakeServer::default());
        let (transport, _) = transport(server.clone()).await;

        let mut session = UploadSession::new(key(&item), item.size, CHUNK);
        let cancel = CancellationToken::new();
        transport
            .initiate(&mut session, &metadata(), &item.content_type, &cancel)
            .await
            .unwrap();

        let mut file = tokio::fs::File::open(&item.path).await.unwrap();
        let mut sum = 0u64;
        while session.remote_id.is_none() {
            let offset = session.bytes_confirmed;
            let len = CHUNK.min(item.size - offset);
            let chunk = read_chunk(&mut file, offset, len).await.unwrap();
            let confirmed = transport
                .send_chunk(&mut session, offset, &chunk, &cancel)
                .await
                .unwrap();
            sum += confirmed - offset;
            assert_eq!(sum, session.bytes_confirmed);
            assert!(session.bytes_confirmed <= session.total_size);
        }

        let id = transport.finalize(&mut session, &cancel).await.unwrap();
        assert_eq!(id, "vid00000001");
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancelled_upload_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (item, _) = write_video(dir.path(), (CHUNK * 2) as usize);
        let server = Arc::new(FakeServer::default());
        let (transport, _) = transport(server.clone()).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = transport
            .upload(&item, &metadata(), key(&item), &cancel, &NoopObserver)
            .await;
        assert!(matches!(result, Err(AppError::Cancelled { .. })));
        assert!(server.sent_ranges.lock().unwrap().is_empty());
    }
}
