use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio::time::Duration;

use crate::config::{get_token_path, CHUNK_ALIGNMENT};
use crate::errors::{AppError, AppResult};
use crate::metadata::Metadata;

use super::transport::{ChunkResponse, ResumableEndpoint};
use super::upload_queue::PublishActions;

pub const API_BASE: &str = "https://www.googleapis.com/youtube/v3";
pub const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/youtube/v3";

const MIN_CHUNK_TIMEOUT: Duration = Duration::from_secs(60);

pub fn watch_url(video_id: &str) -> String {
    format!("https://youtu.be/{}", video_id)
}

pub fn studio_url(video_id: &str) -> String {
    format!("https://studio.youtube.com/video/{}/edit", video_id)
}

/// Supplies the OAuth bearer token. Acquisition and refresh happen elsewhere.
pub trait TokenProvider: Send + Sync {
    fn access_token(&self) -> AppResult<String>;
}

/// Reads the token from `TUBECAST_ACCESS_TOKEN`, then from `token.json`.
pub struct StoredToken;

#[derive(Deserialize)]
struct TokenFile {
    access_token: String,
}

impl StoredToken {
    /// True when a token is set in the environment or saved on disk.
    pub fn is_available() -> bool {
        let from_env = std::env::var("TUBECAST_ACCESS_TOKEN")
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false);
        from_env || get_token_path().map(|p| p.exists()).unwrap_or(false)
    }
}

impl TokenProvider for StoredToken {
    fn access_token(&self) -> AppResult<String> {
        if let Ok(token) = std::env::var("TUBECAST_ACCESS_TOKEN") {
            if !token.trim().is_empty() {
                return Ok(token.trim().to_string());
            }
        }

        let path = get_token_path()?;
        if !path.exists() {
            return Err(AppError::Auth {
                message: format!(
                    "No access token. Set TUBECAST_ACCESS_TOKEN or write {}",
                    path.display()
                ),
            });
        }
        let raw = std::fs::read_to_string(&path)?;
        let token: TokenFile = serde_json::from_str(&raw)?;
        Ok(token.access_token)
    }
}

/// Fixed token, for tests and one-off scripts.
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn access_token(&self) -> AppResult<String> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoSummary {
    pub id: String,
    pub title: String,
    pub published_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoDetails {
    pub id: String,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub privacy: Option<String>,
    pub upload_status: Option<String>,
    pub view_count: Option<u64>,
    pub published_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistSummary {
    pub id: String,
    pub title: String,
    pub item_count: u32,
}

// Wire shapes of the Data API responses this client reads.

#[derive(Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct Snippet {
    title: String,
    description: String,
    tags: Vec<String>,
    published_at: Option<String>,
    resource_id: Option<ResourceId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceId {
    video_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoItem {
    id: String,
    #[serde(default)]
    snippet: Snippet,
    status: Option<VideoStatus>,
    statistics: Option<VideoStatistics>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatus {
    privacy_status: Option<String>,
    upload_status: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatistics {
    view_count: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelItem {
    content_details: ChannelContentDetails,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelContentDetails {
    related_playlists: RelatedPlaylists,
}

#[derive(Deserialize)]
struct RelatedPlaylists {
    uploads: String,
}

#[derive(Deserialize)]
struct PlaylistItemEntry {
    #[serde(default)]
    snippet: Snippet,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistEntry {
    id: String,
    #[serde(default)]
    snippet: Snippet,
    content_details: Option<PlaylistContentDetails>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistContentDetails {
    #[serde(default)]
    item_count: u32,
}

#[derive(Deserialize)]
struct InsertedVideo {
    id: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: String,
}

/// YouTube Data API client: resumable video upload plus the read and
/// playlist calls used by the CLI.
pub struct YouTubeClient {
    client: Client,
    token: Arc<dyn TokenProvider>,
    api_base: String,
    upload_base: String,
    request_timeout: Duration,
}

impl YouTubeClient {
    pub fn new(token: Arc<dyn TokenProvider>, request_timeout: Duration) -> AppResult<Self> {
        // 308 is the resumable protocol's progress reply, never a redirect to follow.
        let client = Client::builder()
            .user_agent(concat!("tubecast/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            token,
            api_base: API_BASE.to_string(),
            upload_base: UPLOAD_BASE.to_string(),
            request_timeout,
        })
    }

    /// Points the client at another server, e.g. a local mock.
    pub fn with_base_urls(mut self, api_base: &str, upload_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.upload_base = upload_base.trim_end_matches('/').to_string();
        self
    }

    fn authorized(&self, request: RequestBuilder) -> AppResult<RequestBuilder> {
        let token = self.token.access_token()?;
        Ok(request.bearer_auth(token))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> AppResult<T> {
        let url = format!("{}/{}", self.api_base, path);
        let request = self
            .client
            .get(&url)
            .query(query)
            .timeout(self.request_timeout);
        let response = self.authorized(request)?.send().await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json::<T>().await?)
    }

    /// Most recent uploads of the authenticated channel.
    pub async fn list_videos(&self, count: u32) -> AppResult<Vec<VideoSummary>> {
        let channels: ListResponse<ChannelItem> = self
            .get_json("channels", &[("part", "contentDetails"), ("mine", "true")])
            .await?;

        let uploads = channels
            .items
            .into_iter()
            .next()
            .map(|c| c.content_details.related_playlists.uploads)
            .ok_or_else(|| AppError::Rejected {
                status: 404,
                message: "Authenticated account has no channel".to_string(),
            })?;

        let max_results = count.clamp(1, 50).to_string();
        let entries: ListResponse<PlaylistItemEntry> = self
            .get_json(
                "playlistItems",
                &[
                    ("part", "snippet"),
                    ("playlistId", &uploads),
                    ("maxResults", &max_results),
                ],
            )
            .await?;

        Ok(entries
            .items
            .into_iter()
            .filter_map(|entry| {
                let snippet = entry.snippet;
                let id = snippet.resource_id.and_then(|r| r.video_id)?;
                Some(VideoSummary {
                    id,
                    title: snippet.title,
                    published_at: snippet.published_at,
                })
            })
            .collect())
    }

    pub async fn get_video(&self, video_id: &str) -> AppResult<VideoDetails> {
        let videos: ListResponse<VideoItem> = self
            .get_json(
                "videos",
                &[("part", "snippet,status,statistics"), ("id", video_id)],
            )
            .await?;

        let item = videos
            .items
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Rejected {
                status: 404,
                message: format!("Video {} not found", video_id),
            })?;

        Ok(VideoDetails {
            id: item.id,
            title: item.snippet.title,
            description: item.snippet.description,
            tags: item.snippet.tags,
            privacy: item.status.as_ref().and_then(|s| s.privacy_status.clone()),
            upload_status: item.status.and_then(|s| s.upload_status),
            view_count: item
                .statistics
                .and_then(|s| s.view_count)
                .and_then(|v| v.parse().ok()),
            published_at: item.snippet.published_at,
        })
    }

    pub async fn list_playlists(&self) -> AppResult<Vec<PlaylistSummary>> {
        let playlists: ListResponse<PlaylistEntry> = self
            .get_json(
                "playlists",
                &[
                    ("part", "snippet,contentDetails"),
                    ("mine", "true"),
                    ("maxResults", "50"),
                ],
            )
            .await?;

        Ok(playlists
            .items
            .into_iter()
            .map(|p| PlaylistSummary {
                id: p.id,
                title: p.snippet.title,
                item_count: p.content_details.map(|c| c.item_count).unwrap_or(0),
            })
            .collect())
    }

    pub async fn add_to_playlist(&self, playlist_id: &str, video_id: &str) -> AppResult<()> {
        let url = format!("{}/playlistItems", self.api_base);
        let body = json!({
            "snippet": {
                "playlistId": playlist_id,
                "resourceId": { "kind": "youtube#video", "videoId": video_id }
            }
        });
        let request = self
            .client
            .post(&url)
            .query(&[("part", "snippet")])
            .json(&body)
            .timeout(self.request_timeout);
        let response = self.authorized(request)?.send().await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        log::info!("Added {} to playlist {}", video_id, playlist_id);
        Ok(())
    }

    pub async fn set_thumbnail(&self, video_id: &str, image_path: &Path) -> AppResult<()> {
        let content_type = match image_path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .as_deref()
        {
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("png") => "image/png",
            _ => {
                return Err(AppError::invalid_file_type(
                    &image_path.to_string_lossy(),
                ))
            }
        };
        let bytes = tokio::fs::read(image_path).await?;

        let url = format!("{}/thumbnails/set", self.upload_base);
        let request = self
            .client
            .post(&url)
            .query(&[("videoId", video_id)])
            .header(CONTENT_TYPE, content_type)
            .body(bytes)
            .timeout(MIN_CHUNK_TIMEOUT);
        let response = self.authorized(request)?.send().await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        log::info!("Thumbnail set for {}", video_id);
        Ok(())
    }

    async fn interpret_upload_response(&self, response: Response) -> AppResult<ChunkResponse> {
        let status = response.status();
        match status.as_u16() {
            200 | 201 => {
                let inserted: InsertedVideo = response.json().await?;
                Ok(ChunkResponse::Complete {
                    remote_id: inserted.id,
                })
            }
            308 => Ok(match parse_range_header(response.headers()) {
                Some(confirmed) => ChunkResponse::Accepted { confirmed },
                None => ChunkResponse::StatusRequested,
            }),
            404 | 410 => Err(AppError::ResumeMismatch {
                local: 0,
                remote: None,
            }),
            _ => Err(error_from_response(response).await),
        }
    }
}

#[async_trait]
impl ResumableEndpoint for YouTubeClient {
    async fn initiate(
        &self,
        metadata: &Metadata,
        total_size: u64,
        content_type: &str,
    ) -> AppResult<String> {
        let url = format!("{}/videos", self.upload_base);
        let request = self
            .client
            .post(&url)
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .header("X-Upload-Content-Length", total_size.to_string())
            .header("X-Upload-Content-Type", content_type)
            .json(&video_resource(metadata))
            .timeout(self.request_timeout);
        let response = self.authorized(request)?.send().await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AppError::Server {
                status: response.status().as_u16(),
                message: "Upload session response had no Location header".to_string(),
            })
    }

    async fn send_chunk(
        &self,
        session_url: &str,
        offset: u64,
        total_size: u64,
        bytes: &[u8],
    ) -> AppResult<ChunkResponse> {
        let end = offset + bytes.len() as u64 - 1;
        let request = self
            .client
            .put(session_url)
            .header(CONTENT_LENGTH, bytes.len().to_string())
            .header(CONTENT_RANGE, format!("bytes {}-{}/{}", offset, end, total_size))
            .body(bytes.to_vec())
            .timeout(chunk_timeout(bytes.len() as u64));
        let response = self.authorized(request)?.send().await?;
        self.interpret_upload_response(response).await
    }

    async fn query_status(&self, session_url: &str, total_size: u64) -> AppResult<ChunkResponse> {
        let request = self
            .client
            .put(session_url)
            .header(CONTENT_LENGTH, "0")
            .header(CONTENT_RANGE, format!("bytes */{}", total_size))
            .timeout(self.request_timeout);
        let response = self.authorized(request)?.send().await?;

        match self.interpret_upload_response(response).await? {
            // Without a Range header the server holds nothing yet.
            ChunkResponse::StatusRequested => Ok(ChunkResponse::Accepted { confirmed: 0 }),
            other => Ok(other),
        }
    }
}

#[async_trait]
impl PublishActions for YouTubeClient {
    async fn add_to_playlist(&self, playlist_id: &str, video_id: &str) -> AppResult<()> {
        YouTubeClient::add_to_playlist(self, playlist_id, video_id).await
    }

    async fn set_thumbnail(&self, video_id: &str, image_path: &Path) -> AppResult<()> {
        YouTubeClient::set_thumbnail(self, video_id, image_path).await
    }
}

fn video_resource(metadata: &Metadata) -> serde_json::Value {
    json!({
        "snippet": {
            "title": metadata.title,
            "description": metadata.description,
            "tags": metadata.tags.as_slice(),
            "categoryId": metadata.category,
        },
        "status": {
            "privacyStatus": metadata.privacy.as_str(),
            "selfDeclaredMadeForKids": metadata.made_for_kids,
            "containsSyntheticMedia": metadata.contains_synthetic_media,
        }
    })
}

/// Scales with chunk size at a floor of 256 KiB/s, never under a minute.
pub fn chunk_timeout(chunk_len: u64) -> Duration {
    Duration::from_secs(chunk_len / CHUNK_ALIGNMENT).max(MIN_CHUNK_TIMEOUT)
}

/// `Range: bytes=0-N` means the server holds N + 1 bytes.
fn parse_range_header(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(RANGE)?.to_str().ok()?;
    let (_, end) = value.trim().strip_prefix("bytes=")?.split_once('-')?;
    end.trim().parse::<u64>().ok().map(|last| last + 1)
}

fn parse_retry_after(headers: &HeaderMap) -> u64 {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .map(|secs| (secs * 1000.0) as u64)
        .unwrap_or(0)
}

async fn error_from_response(response: Response) -> AppError {
    let status = response.status();
    let retry_after_ms = parse_retry_after(response.headers());
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    classify_status(status, retry_after_ms, &body)
}

/// Maps a non-success API status plus its error body onto the error taxonomy.
pub fn classify_status(status: StatusCode, retry_after_ms: u64, body: &str) -> AppError {
    let (message, reasons) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => (
            envelope.error.message,
            envelope
                .error
                .errors
                .into_iter()
                .map(|e| e.reason)
                .collect::<Vec<_>>(),
        ),
        Err(_) => (body.chars().take(300).collect(), Vec::new()),
    };
    let has_reason = |wanted: &str| reasons.iter().any(|r| r == wanted);

    match status.as_u16() {
        403 if has_reason("quotaExceeded")
            || has_reason("uploadLimitExceeded")
            || has_reason("dailyLimitExceeded") =>
        {
            // Placeholder reset; the quota tracker substitutes the real one.
            AppError::QuotaExceeded {
                message,
                resets_at: chrono::Utc::now() + chrono::Duration::days(1),
            }
        }
        401 => AppError::Auth { message },
        403 if has_reason("forbidden")
            || has_reason("insufficientPermissions")
            || has_reason("authError") =>
        {
            AppError::Auth { message }
        }
        400 => AppError::Validation {
            field: reasons.first().cloned().unwrap_or_else(|| "request".into()),
            message,
        },
        429 => AppError::RateLimit { retry_after_ms },
        code if status.is_server_error() => AppError::Server {
            status: code,
            message,
        },
        code => AppError::Rejected {
            status: code,
            message,
        },
    }
}
