use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::database::{SqliteStore, UploadRecord};
use crate::errors::{AppError, AppResult};
use crate::media::{self, MediaItem};
use crate::metadata::MetadataResolver;

use super::progress_tracker::UploadObserver;
use super::quota::{cost, QuotaDecision, QuotaTracker};
use super::retry::RetryPolicy;
use super::session::{SessionKey, SessionStore};
use super::transport::ChunkedTransport;
use super::youtube_client::watch_url;

pub const QUOTA_EXHAUSTED: &str = "quota exhausted";
pub const CANCELLED: &str = "cancelled";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Success { video_id: String, watch_url: String },
    Failed { reason: String },
    Skipped { reason: String },
}

impl ItemOutcome {
    fn skipped(reason: &str) -> Self {
        ItemOutcome::Skipped {
            reason: reason.to_string(),
        }
    }

    fn failed(reason: impl ToString) -> Self {
        ItemOutcome::Failed {
            reason: reason.to_string(),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            ItemOutcome::Success { .. } => "success",
            ItemOutcome::Failed { .. } => "failed",
            ItemOutcome::Skipped { .. } => "skipped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ItemResult {
    pub path: PathBuf,
    pub outcome: ItemOutcome,
}

/// Per-item outcomes in input order.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub items: Vec<ItemResult>,
}

impl BatchResult {
    fn count(&self, status: &str) -> usize {
        self.items
            .iter()
            .filter(|r| r.outcome.status() == status)
            .count()
    }

    pub fn succeeded(&self) -> usize {
        self.count("success")
    }

    pub fn failed(&self) -> usize {
        self.count("failed")
    }

    pub fn skipped(&self) -> usize {
        self.count("skipped")
    }

    /// Zero unless some item failed.
    pub fn exit_code(&self) -> i32 {
        if self.failed() > 0 {
            1
        } else {
            0
        }
    }
}

/// Calls made after a video exists remotely. Failures here never fail the item.
#[async_trait]
pub trait PublishActions: Send + Sync {
    async fn add_to_playlist(&self, playlist_id: &str, video_id: &str) -> AppResult<()>;
    async fn set_thumbnail(&self, video_id: &str, image_path: &Path) -> AppResult<()>;
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub playlist_id: Option<String>,
    pub thumbnail: Option<PathBuf>,
    /// Throw away any stored session and start each upload from zero.
    pub fresh: bool,
}

enum Flow {
    Continue,
    /// Stop uploading; every remaining item is skipped with this reason.
    Halt(&'static str),
}

/// Uploads items one at a time, under the daily quota, collecting outcomes.
pub struct BatchOrchestrator {
    transport: ChunkedTransport,
    sessions: Arc<dyn SessionStore>,
    quota: QuotaTracker,
    retry: RetryPolicy,
    cancel: CancellationToken,
    observer: Arc<dyn UploadObserver>,
    publisher: Option<Arc<dyn PublishActions>>,
    history: Option<SqliteStore>,
    options: BatchOptions,
}

impl BatchOrchestrator {
    pub fn new(
        transport: ChunkedTransport,
        sessions: Arc<dyn SessionStore>,
        quota: QuotaTracker,
        retry: RetryPolicy,
        cancel: CancellationToken,
        observer: Arc<dyn UploadObserver>,
    ) -> Self {
        Self {
            transport,
            sessions,
            quota,
            retry,
            cancel,
            observer,
            publisher: None,
            history: None,
            options: BatchOptions::default(),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn PublishActions>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_history(mut self, history: SqliteStore) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_options(mut self, options: BatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn quota(&mut self) -> &mut QuotaTracker {
        &mut self.quota
    }

    pub async fn run(&mut self, items: Vec<MediaItem>, resolver: &dyn MetadataResolver) -> BatchResult {
        let total = items.len();
        let mut result = BatchResult {
            items: Vec::with_capacity(total),
        };
        let mut halted: Option<&'static str> = None;

        log::info!("Starting batch of {} item(s)", total);

        for (index, item) in items.iter().enumerate() {
            if halted.is_none() && self.cancel.is_cancelled() {
                halted = Some(CANCELLED);
            }

            let outcome = match halted {
                Some(reason) => ItemOutcome::skipped(reason),
                None => {
                    self.observer.on_item_started(index, total, item);
                    let (outcome, flow) = self.process_item(item, resolver).await;
                    if let Flow::Halt(reason) = flow {
                        log::warn!(
                            "Stopping batch after {}: remaining items skipped ({})",
                            item.file_name(),
                            reason
                        );
                        halted = Some(reason);
                    }
                    outcome
                }
            };

            match &outcome {
                ItemOutcome::Success { video_id, .. } => {
                    log::info!("Uploaded {} as {}", item.file_name(), video_id)
                }
                ItemOutcome::Failed { reason } => {
                    log::error!("Failed {}: {}", item.file_name(), reason)
                }
                ItemOutcome::Skipped { reason } => {
                    log::info!("Skipped {}: {}", item.file_name(), reason)
                }
            }

            self.record_history(item, &outcome).await;
            self.observer.on_item_finished(index, item, &outcome);
            result.items.push(ItemResult {
                path: item.path.clone(),
                outcome,
            });
        }

        log::info!(
            "Batch finished: {} succeeded, {} failed, {} skipped",
            result.succeeded(),
            result.failed(),
            result.skipped()
        );
        result
    }

    async fn process_item(
        &mut self,
        item: &MediaItem,
        resolver: &dyn MetadataResolver,
    ) -> (ItemOutcome, Flow) {
        let metadata = match resolver.resolve(item).await {
            Ok(metadata) => metadata,
            Err(e) if e.is_cancelled() => return (ItemOutcome::failed(CANCELLED), Flow::Halt(CANCELLED)),
            Err(e) => return (ItemOutcome::Skipped { reason: e.to_string() }, Flow::Continue),
        };

        if let QuotaDecision::Denied { reason, resets_at } = self.quota.reserve(cost::VIDEO_INSERT) {
            log::warn!("Upload quota denied ({}); resets at {}", reason, resets_at);
            return (ItemOutcome::skipped(QUOTA_EXHAUSTED), Flow::Halt(QUOTA_EXHAUSTED));
        }

        let key = match self.session_key(item).await {
            Ok(key) => key,
            Err(e) => return (ItemOutcome::failed(e), Flow::Continue),
        };

        let uploaded = self
            .transport
            .upload(item, &metadata, key, &self.cancel, self.observer.as_ref())
            .await;

        match uploaded {
            Ok(video_id) => {
                if let Err(e) = self.quota.commit(cost::VIDEO_INSERT).await {
                    log::error!("Failed to record quota usage: {}", e);
                }
                self.after_upload(&video_id).await;
                let outcome = ItemOutcome::Success {
                    watch_url: watch_url(&video_id),
                    video_id,
                };
                (outcome, Flow::Continue)
            }
            Err(e) if e.is_cancelled() => (ItemOutcome::failed(CANCELLED), Flow::Halt(CANCELLED)),
            Err(e @ AppError::QuotaExceeded { .. }) => {
                if let Err(store_err) = self.quota.mark_exhausted().await {
                    log::error!("Failed to record exhausted quota: {}", store_err);
                }
                let e = self.quota.with_local_reset(e);
                (ItemOutcome::failed(e), Flow::Halt(QUOTA_EXHAUSTED))
            }
            Err(e) => (ItemOutcome::failed(e), Flow::Continue),
        }
    }

    async fn session_key(&self, item: &MediaItem) -> AppResult<SessionKey> {
        let key = SessionKey {
            file_path: item.path.to_string_lossy().to_string(),
            content_hash: media::get_file_hash(&item.path).await?,
        };
        if self.options.fresh {
            log::info!("Discarding any stored session for {}", key);
            self.sessions.discard_session(&key).await?;
        }
        Ok(key)
    }

    async fn after_upload(&mut self, video_id: &str) {
        let Some(publisher) = self.publisher.clone() else {
            return;
        };

        if let Some(thumbnail) = self.options.thumbnail.clone() {
            if self.quota.reserve(cost::THUMBNAIL_SET).is_allowed() {
                let attempt = self
                    .retry
                    .execute(|| publisher.set_thumbnail(video_id, &thumbnail), &self.cancel)
                    .await;
                match attempt {
                    Ok(()) => self.commit_quietly(cost::THUMBNAIL_SET).await,
                    Err(e) => log::warn!("Could not set thumbnail for {}: {}", video_id, e),
                }
            } else {
                log::warn!("Not enough quota left to set the thumbnail for {}", video_id);
            }
        }

        if let Some(playlist_id) = self.options.playlist_id.clone() {
            if self.quota.reserve(cost::PLAYLIST_ITEM_INSERT).is_allowed() {
                let attempt = self
                    .retry
                    .execute(|| publisher.add_to_playlist(&playlist_id, video_id), &self.cancel)
                    .await;
                match attempt {
                    Ok(()) => self.commit_quietly(cost::PLAYLIST_ITEM_INSERT).await,
                    Err(e) => log::warn!(
                        "Could not add {} to playlist {}: {}",
                        video_id,
                        playlist_id,
                        e
                    ),
                }
            } else {
                log::warn!("Not enough quota left to add {} to a playlist", video_id);
            }
        }
    }

    async fn commit_quietly(&mut self, units: u32) {
        if let Err(e) = self.quota.commit(units).await {
            log::error!("Failed to record quota usage: {}", e);
        }
    }

    async fn record_history(&self, item: &MediaItem, outcome: &ItemOutcome) {
        let Some(history) = &self.history else {
            return;
        };

        let (video_id, error_message) = match outcome {
            ItemOutcome::Success { video_id, .. } => (Some(video_id.clone()), None),
            ItemOutcome::Failed { reason } | ItemOutcome::Skipped { reason } => {
                (None, Some(reason.clone()))
            }
        };
        let record = UploadRecord {
            file_path: item.path.to_string_lossy().to_string(),
            file_name: item.file_name(),
            file_hash: None,
            file_size: Some(item.size),
            video_id,
            status: outcome.status().to_string(),
            error_message,
            uploaded_at: None,
        };

        if let Err(e) = history.record_upload(&record).await {
            log::warn!("Failed to record upload history for {}: {}", record.file_name, e);
        }
    }
}
