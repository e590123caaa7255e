use chrono::Local;
use clap::Args;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::{self, Config};
use crate::database::SqliteStore;
use crate::errors::{AppError, AppResult};
use crate::gemini::GeminiGenerator;
use crate::media::{self, MediaItem};
use crate::metadata::{
    LayeredResolver, MetadataDefaults, MetadataOverrides, Privacy, PromptWhen, Tags,
};
use crate::security::InputValidator;
use crate::ui::{self, MenuAction, PromptMetadata, TerminalObserver};
use crate::uploader::quota::{cost, QuotaTracker, SystemClock};
use crate::uploader::retry::RetryPolicy;
use crate::uploader::session::SessionStore;
use crate::uploader::transport::ChunkedTransport;
use crate::uploader::upload_queue::{BatchOptions, BatchOrchestrator, BatchResult, ItemOutcome};
use crate::uploader::youtube_client::{studio_url, watch_url, StoredToken, YouTubeClient};

/// History rows older than this are pruned on startup.
const HISTORY_RETENTION_DAYS: i32 = 90;

/// Videos shown by `list` when no count is given.
pub const DEFAULT_LIST_COUNT: u32 = 10;

#[derive(Debug, Default, Args)]
pub struct UploadArgs {
    /// Video file to upload
    pub file: PathBuf,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long)]
    pub description: Option<String>,
    /// Comma-separated tags
    #[arg(long)]
    pub tags: Option<String>,
    /// public, unlisted or private
    #[arg(long)]
    pub privacy: Option<Privacy>,
    /// Numeric category id
    #[arg(long)]
    pub category: Option<String>,
    /// Generate title, description and tags with Gemini
    #[arg(long)]
    pub ai: bool,
    /// Hint passed to the generator
    #[arg(long)]
    pub context: Option<String>,
    /// Prompt for metadata
    #[arg(long, short)]
    pub interactive: bool,
    /// Add the uploaded video to this playlist
    #[arg(long)]
    pub playlist: Option<String>,
    /// JPEG or PNG thumbnail
    #[arg(long)]
    pub thumbnail: Option<PathBuf>,
    /// Ignore any stored session and upload from the start
    #[arg(long)]
    pub fresh: bool,
    /// Upload even when today's quota budget is used up
    #[arg(long)]
    pub ignore_quota: bool,
}

#[derive(Debug, Default, Args)]
pub struct BatchArgs {
    /// Folder with video files (and optional .json sidecars)
    pub folder: PathBuf,
    #[arg(long)]
    pub privacy: Option<Privacy>,
    #[arg(long)]
    pub category: Option<String>,
    #[arg(long)]
    pub ai: bool,
    #[arg(long)]
    pub context: Option<String>,
    #[arg(long)]
    pub playlist: Option<String>,
    #[arg(long)]
    pub ignore_quota: bool,
}

/// Everything a command needs, built once in `main`.
pub struct AppContext {
    pub config: Config,
    pub store: SqliteStore,
    pub cancel: CancellationToken,
}

impl AppContext {
    pub async fn open(config: Config, cancel: CancellationToken) -> AppResult<Self> {
        let store = SqliteStore::open_default().await?;
        match store.cleanup_old_upload_history(HISTORY_RETENTION_DAYS).await {
            Ok(0) => {}
            Ok(removed) => log::debug!("Pruned {} old history rows", removed),
            Err(e) => log::warn!("Failed to prune upload history: {}", e),
        }

        Ok(Self {
            config,
            store,
            cancel,
        })
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.retry_config())
    }

    fn client(&self) -> AppResult<Arc<YouTubeClient>> {
        Ok(Arc::new(YouTubeClient::new(
            Arc::new(StoredToken),
            self.config.request_timeout(),
        )?))
    }

    async fn quota(&self, ignore_quota: bool) -> AppResult<QuotaTracker> {
        let tracker = QuotaTracker::load(
            Arc::new(self.store.clone()),
            self.config.daily_quota_budget,
            self.config.timezone()?,
            Arc::new(SystemClock),
        )
        .await?;
        Ok(tracker.with_overrun(ignore_quota))
    }

    fn resolver(
        &self,
        overrides: MetadataOverrides,
        ai: bool,
        context: Option<String>,
        prompt: Option<PromptWhen>,
    ) -> AppResult<LayeredResolver> {
        let mut resolver = LayeredResolver::new(
            MetadataDefaults::from(&self.config),
            self.retry(),
            self.cancel.clone(),
        )
        .with_overrides(overrides)
        .with_context(context.unwrap_or_default());

        if ai {
            match self.config.gemini_key() {
                Some(key) => {
                    let generator = GeminiGenerator::new(
                        key,
                        self.config.gemini_model.clone(),
                        self.config.request_timeout(),
                    )?;
                    resolver = resolver.with_generator(Arc::new(generator));
                }
                None => log::warn!(
                    "AI metadata requested but no Gemini API key is configured; run 'tubecast setup' or set GEMINI_API_KEY"
                ),
            }
        }

        if let Some(when) = prompt {
            resolver = resolver.with_manual(Arc::new(PromptMetadata), when);
        }
        Ok(resolver)
    }

    async fn orchestrator(
        &self,
        client: Arc<YouTubeClient>,
        items: &[MediaItem],
        options: BatchOptions,
        ignore_quota: bool,
    ) -> AppResult<BatchOrchestrator> {
        let sessions: Arc<dyn SessionStore> = Arc::new(self.store.clone());
        let transport = ChunkedTransport::new(
            client.clone(),
            sessions.clone(),
            self.retry(),
            self.config.chunk_size_bytes(),
        );

        Ok(BatchOrchestrator::new(
            transport,
            sessions,
            self.quota(ignore_quota).await?,
            self.retry(),
            self.cancel.clone(),
            Arc::new(TerminalObserver::new(items)),
        )
        .with_publisher(client)
        .with_history(self.store.clone())
        .with_options(options))
    }
}

/// Whether `upload` asks for metadata on the terminal. Nothing is asked
/// when stdin is not a terminal, unless `-i` forced it.
fn upload_prompt(args: &UploadArgs, attended: bool) -> Option<PromptWhen> {
    if args.interactive {
        return Some(PromptWhen::Always);
    }
    match (attended, args.title.is_some(), args.ai) {
        (true, false, false) => Some(PromptWhen::Always),
        (true, false, true) => Some(PromptWhen::Fallback),
        _ => None,
    }
}

fn validate_playlist(playlist: &Option<String>) -> AppResult<()> {
    if let Some(id) = playlist {
        InputValidator::validate_playlist_id(id)?;
    }
    Ok(())
}

fn print_summary(result: &BatchResult) {
    println!(
        "\n{} uploaded, {} failed, {} skipped",
        result.succeeded(),
        result.failed(),
        result.skipped()
    );
    for item in &result.items {
        if let ItemOutcome::Success { video_id, .. } = &item.outcome {
            println!("  {}  {}", video_id, studio_url(video_id));
        }
    }
}

pub async fn upload(ctx: &AppContext, args: UploadArgs) -> AppResult<i32> {
    let item = MediaItem::from_path(&args.file)?;
    validate_playlist(&args.playlist)?;
    if let Some(thumbnail) = &args.thumbnail {
        if !thumbnail.is_file() {
            return Err(AppError::file_not_found(&thumbnail.to_string_lossy()));
        }
    }

    let prompt = upload_prompt(&args, std::io::stdin().is_terminal());
    // AI also runs when enabled in settings, unless the caller typed a title.
    let ai = args.ai || (ctx.config.ai_enabled && args.title.is_none());

    let overrides = MetadataOverrides {
        title: args.title,
        description: args.description,
        tags: args.tags.as_deref().map(Tags::from_comma_separated),
        privacy: args.privacy,
        category: args.category,
    };
    let resolver = ctx.resolver(overrides, ai, args.context, prompt)?;

    let options = BatchOptions {
        playlist_id: args.playlist,
        thumbnail: args.thumbnail,
        fresh: args.fresh,
    };
    let items = vec![item];
    let mut orchestrator = ctx
        .orchestrator(ctx.client()?, &items, options, args.ignore_quota)
        .await?;
    let result = orchestrator.run(items, &resolver).await;

    print_summary(&result);
    Ok(result.exit_code())
}

pub async fn batch(ctx: &AppContext, args: BatchArgs) -> AppResult<i32> {
    validate_playlist(&args.playlist)?;
    let items = media::discover(&args.folder)?;
    if items.is_empty() {
        println!("No video files found in {}", args.folder.display());
        return Ok(0);
    }

    let with_sidecar = items.iter().filter(|i| i.sidecar.is_some()).count();
    println!(
        "Found {} video(s) in {} ({} with sidecar metadata)",
        items.len(),
        args.folder.display(),
        with_sidecar
    );

    let overrides = MetadataOverrides {
        privacy: args.privacy,
        category: args.category,
        ..MetadataOverrides::default()
    };
    // Batches only generate when asked to and enabled in settings.
    let ai = args.ai && ctx.config.ai_enabled;
    if args.ai && !ai {
        log::warn!("--ai ignored: AI metadata is disabled in settings (run 'tubecast setup')");
    }
    let resolver = ctx.resolver(overrides, ai, args.context, None)?;

    let options = BatchOptions {
        playlist_id: args.playlist,
        ..BatchOptions::default()
    };
    let mut orchestrator = ctx
        .orchestrator(ctx.client()?, &items, options, args.ignore_quota)
        .await?;
    let result = orchestrator.run(items, &resolver).await;

    print_summary(&result);
    Ok(result.exit_code())
}

/// Reserves read units, runs the call, and charges only if it succeeded.
async fn metered<T, F, Fut>(ctx: &AppContext, units: u32, call: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = AppResult<T>>,
{
    let mut quota = ctx.quota(false).await?;
    quota.reserve(units).into_result()?;
    let value = ctx
        .retry()
        .execute(call, &ctx.cancel)
        .await
        .map_err(|e| quota.with_local_reset(e))?;
    if let Err(e) = quota.commit(units).await {
        log::warn!("Failed to record quota usage: {}", e);
    }
    Ok(value)
}

pub async fn list(ctx: &AppContext, count: u32) -> AppResult<i32> {
    let client = ctx.client()?;
    let videos = metered(ctx, 2 * cost::READ, || client.list_videos(count)).await?;

    if videos.is_empty() {
        println!("No uploads found");
        return Ok(0);
    }
    for video in videos {
        println!(
            "{}  {}  {}",
            video.id,
            video.published_at.as_deref().unwrap_or("-"),
            video.title
        );
    }
    Ok(0)
}

pub async fn info(ctx: &AppContext, video_id: &str) -> AppResult<i32> {
    InputValidator::validate_video_id(video_id)?;
    let client = ctx.client()?;
    let video = metered(ctx, cost::READ, || client.get_video(video_id)).await?;

    println!("Title:       {}", video.title);
    println!("ID:          {}", video.id);
    println!("URL:         {}", watch_url(&video.id));
    println!("Studio:      {}", studio_url(&video.id));
    println!("Privacy:     {}", video.privacy.as_deref().unwrap_or("-"));
    println!("Status:      {}", video.upload_status.as_deref().unwrap_or("-"));
    if let Some(views) = video.view_count {
        println!("Views:       {}", views);
    }
    if let Some(published) = &video.published_at {
        println!("Published:   {}", published);
    }
    if !video.tags.is_empty() {
        println!("Tags:        {}", video.tags.join(", "));
    }
    if !video.description.is_empty() {
        println!("\n{}", video.description);
    }
    Ok(0)
}

pub async fn playlists(ctx: &AppContext) -> AppResult<i32> {
    let client = ctx.client()?;
    let playlists = metered(ctx, cost::READ, || client.list_playlists()).await?;

    if playlists.is_empty() {
        println!("No playlists found");
    }
    for playlist in playlists {
        println!(
            "{}  {} ({} videos)",
            playlist.id, playlist.title, playlist.item_count
        );
    }
    Ok(0)
}

fn configure(config: Config) -> AppResult<Config> {
    let updated = ui::run_setup(config)?;
    config::save_config(&updated)?;
    println!("Settings saved");
    Ok(updated)
}

pub fn setup(config: Config) -> AppResult<i32> {
    configure(config).map(|_| 0)
}

/// Menu loop for a bare `tubecast`. A failed action is reported and the
/// menu comes back; Ctrl+C during an action ends the loop.
pub async fn interactive(ctx: &mut AppContext) -> AppResult<i32> {
    if !StoredToken::is_available() {
        println!("Welcome to tubecast! Let's set you up.\n");
        configure(ctx.config.clone())?;
        println!(
            "\nNo access token yet. Save one to {} or set TUBECAST_ACCESS_TOKEN.",
            config::get_token_path()?.display()
        );
        return Ok(0);
    }

    loop {
        let outcome = match ui::main_menu()? {
            MenuAction::Exit => break,
            MenuAction::Upload(file) => {
                upload(ctx, UploadArgs {
                    file,
                    ..UploadArgs::default()
                })
                .await
            }
            MenuAction::Batch { folder, ai } => {
                batch(ctx, BatchArgs {
                    folder,
                    ai,
                    ..BatchArgs::default()
                })
                .await
            }
            MenuAction::List => list(ctx, DEFAULT_LIST_COUNT).await,
            MenuAction::Playlists => playlists(ctx).await,
            MenuAction::Info(video_id) => info(ctx, &video_id).await,
            MenuAction::Settings => configure(ctx.config.clone()).map(|updated| {
                ctx.config = updated;
                0
            }),
        };

        if let Err(e) = outcome {
            log::error!("Menu action failed: {}", e);
            eprintln!("Error: {}", e);
        }
        if ctx.cancel.is_cancelled() {
            println!("Interrupted");
            return Ok(1);
        }
        println!();
    }

    println!("Goodbye!");
    Ok(0)
}

pub async fn quota(ctx: &AppContext) -> AppResult<i32> {
    let mut tracker = ctx.quota(false).await?;
    let resets_at = tracker.resets_at();
    let ledger = tracker.ledger();

    println!("Quota day:   {} ({})", ledger.day, ctx.config.quota_timezone);
    println!("Used:        {} / {} units", ledger.consumed, ledger.budget);
    println!("Remaining:   {} units", ledger.remaining());
    println!(
        "Uploads left: {}",
        ledger.remaining() / cost::VIDEO_INSERT
    );
    println!(
        "Resets at:   {}",
        resets_at.with_timezone(&Local).format("%Y-%m-%d %H:%M %Z")
    );
    Ok(0)
}

pub async fn sessions(ctx: &AppContext) -> AppResult<i32> {
    let sessions = ctx.store.list_sessions().await?;
    if sessions.is_empty() {
        println!("No resumable uploads");
        return Ok(0);
    }

    for session in sessions {
        println!(
            "{:<11} {:>5.1}%  {}  (updated {})",
            session.status.as_str(),
            session.progress_percent(),
            session.key.file_path,
            session.updated_at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
        );
        if let Some(error) = &session.last_error {
            println!("            last error: {}", error);
        }
    }
    Ok(0)
}

pub async fn history(ctx: &AppContext, count: u32) -> AppResult<i32> {
    let records = ctx.store.recent_uploads(count).await?;
    if records.is_empty() {
        println!("No uploads recorded yet");
        return Ok(0);
    }

    for record in records {
        let when = record
            .uploaded_at
            .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let detail = match (&record.video_id, &record.error_message) {
            (Some(id), _) => watch_url(id),
            (None, Some(error)) => error.clone(),
            (None, None) => String::new(),
        };
        println!("{}  {:<8} {}  {}", when, record.status, record.file_name, detail);
    }
    Ok(0)
}
