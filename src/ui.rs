// Terminal rendering: progress bars for uploads and the interactive prompts.

use dialoguer::{Confirm, Input, Password, Select};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::{Config, CATEGORY_OPTIONS, GEMINI_MODELS};
use crate::errors::AppResult;
use crate::media::MediaItem;
use crate::metadata::{ManualMetadataSource, Metadata, Privacy, Tags};
use crate::uploader::progress_tracker::{format_eta, BatchProgress, UploadObserver};
use crate::uploader::upload_queue::ItemOutcome;

const BAR_TEMPLATE: &str =
    "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// One byte-level progress bar per item plus batch totals.
pub struct TerminalObserver {
    bar: Mutex<Option<ProgressBar>>,
    batch: Mutex<BatchProgress>,
}

impl TerminalObserver {
    pub fn new(items: &[MediaItem]) -> Self {
        let total_bytes = items.iter().map(|i| i.size).sum();
        Self {
            bar: Mutex::new(None),
            batch: Mutex::new(BatchProgress::new(items.len(), total_bytes)),
        }
    }

    /// Runs `f` on the current bar, drawing it first if it is still hidden.
    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        match self.bar.lock() {
            Ok(guard) => {
                if let Some(bar) = guard.as_ref() {
                    if bar.is_hidden() {
                        bar.set_draw_target(ProgressDrawTarget::stderr());
                    }
                    f(bar);
                }
            }
            Err(e) => log::warn!("Failed to acquire progress bar lock (non-critical): {}", e),
        }
    }
}

impl UploadObserver for TerminalObserver {
    fn on_item_started(&self, index: usize, total: usize, item: &MediaItem) {
        // Hidden until bytes move, so metadata prompts are not drawn over.
        let bar = ProgressBar::with_draw_target(Some(item.size), ProgressDrawTarget::hidden());
        if let Ok(style) = ProgressStyle::with_template(BAR_TEMPLATE) {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_message(format!("[{}/{}] {}", index + 1, total, item.file_name()));

        if let Ok(mut guard) = self.bar.lock() {
            *guard = Some(bar);
        }
    }

    fn on_resumed(&self, _item: &MediaItem, offset: u64, total_size: u64) {
        self.with_bar(|bar| {
            bar.println(format!(
                "  Resuming previous upload at {:.1}%",
                offset as f64 / total_size.max(1) as f64 * 100.0
            ))
        });
    }

    fn on_restart(&self, item: &MediaItem) {
        self.with_bar(|bar| {
            bar.println(format!(
                "  Stored session for {} no longer matches the server, starting over",
                item.file_name()
            ))
        });
    }

    fn on_chunk_confirmed(&self, confirmed: u64, _total_size: u64) {
        self.with_bar(|bar| bar.set_position(confirmed));
    }

    fn on_item_finished(&self, _index: usize, item: &MediaItem, outcome: &ItemOutcome) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(bar) = guard.take() {
                bar.finish_and_clear();
            }
        }

        match outcome {
            ItemOutcome::Success { watch_url, .. } => {
                println!("✓ {} → {}", item.file_name(), watch_url)
            }
            ItemOutcome::Failed { reason } => println!("✗ {}: {}", item.file_name(), reason),
            ItemOutcome::Skipped { reason } => {
                println!("- {} skipped: {}", item.file_name(), reason)
            }
        }

        if let Ok(mut batch) = self.batch.lock() {
            batch.record(outcome, item.size);
            if batch.finished < batch.total_items {
                if let Some(eta) = batch.time_remaining() {
                    println!(
                        "  {:.0}% of batch done, about {} left",
                        batch.percent(),
                        format_eta(eta)
                    );
                }
            }
        }
    }
}

/// Asks for metadata on the terminal, prefilled with `suggestion`.
pub struct PromptMetadata;

impl ManualMetadataSource for PromptMetadata {
    fn prompt(&self, item: &MediaItem, suggestion: Metadata) -> AppResult<Metadata> {
        println!("\nMetadata for {}", item.file_name());

        let title: String = Input::new()
            .with_prompt("Title")
            .default(suggestion.title.clone())
            .interact_text()?;

        let description: String = Input::new()
            .with_prompt("Description")
            .allow_empty(true)
            .default(suggestion.description.clone())
            .interact_text()?;

        let tags: String = Input::new()
            .with_prompt("Tags (comma separated)")
            .allow_empty(true)
            .default(suggestion.tags.joined())
            .interact_text()?;

        let privacy = select_privacy(suggestion.privacy)?;

        Ok(Metadata {
            title: title.trim().to_string(),
            description,
            tags: Tags::from_comma_separated(&tags),
            privacy,
            ..suggestion
        })
    }
}

fn select_privacy(current: Privacy) -> AppResult<Privacy> {
    let labels: Vec<String> = Privacy::ALL
        .iter()
        .map(|p| format!("{} - {}", p, p.describe()))
        .collect();
    let default = Privacy::ALL.iter().position(|p| *p == current).unwrap_or(0);

    let choice = Select::new()
        .with_prompt("Privacy")
        .items(&labels)
        .default(default)
        .interact()?;
    Ok(Privacy::ALL[choice])
}

/// Interactive editor for the config file.
pub fn run_setup(mut config: Config) -> AppResult<Config> {
    println!("tubecast setup\n");

    config.default_privacy = select_privacy(config.default_privacy)?;

    let category_labels: Vec<String> = CATEGORY_OPTIONS
        .iter()
        .map(|(id, name)| format!("{} ({})", name, id))
        .collect();
    let current_category = CATEGORY_OPTIONS
        .iter()
        .position(|(id, _)| *id == config.default_category)
        .unwrap_or(0);
    let category = Select::new()
        .with_prompt("Default category")
        .items(&category_labels)
        .default(current_category)
        .interact()?;
    config.default_category = CATEGORY_OPTIONS[category].0.to_string();

    config.contains_synthetic_media = Confirm::new()
        .with_prompt("Declare uploads as containing synthetic (AI) media?")
        .default(config.contains_synthetic_media)
        .interact()?;

    config.ai_enabled = Confirm::new()
        .with_prompt("Generate metadata with Gemini by default?")
        .default(config.ai_enabled)
        .interact()?;

    if config.ai_enabled {
        let key = Password::new()
            .with_prompt("Gemini API key (empty keeps the current one / GEMINI_API_KEY)")
            .allow_empty_password(true)
            .interact()?;
        if !key.trim().is_empty() {
            config.gemini_api_key = Some(key.trim().to_string());
        }

        let model_labels: Vec<&str> = GEMINI_MODELS.iter().map(|(_, label)| *label).collect();
        let current_model = GEMINI_MODELS
            .iter()
            .position(|(id, _)| *id == config.gemini_model)
            .unwrap_or(0);
        let model = Select::new()
            .with_prompt("Gemini model")
            .items(&model_labels)
            .default(current_model)
            .interact()?;
        config.gemini_model = GEMINI_MODELS[model].0.to_string();
    }

    config.daily_quota_budget = Input::new()
        .with_prompt("Daily quota budget (units)")
        .default(config.daily_quota_budget)
        .interact_text()?;

    config.chunk_size_mib = Input::new()
        .with_prompt("Upload chunk size (MiB)")
        .default(config.chunk_size_mib)
        .interact_text()?;

    Ok(config)
}

/// What the user picked from the main menu.
#[derive(Debug, Clone, PartialEq)]
pub enum MenuAction {
    Upload(PathBuf),
    Batch { folder: PathBuf, ai: bool },
    List,
    Playlists,
    Info(String),
    Settings,
    Exit,
}

const MENU_ITEMS: &[&str] = &[
    "Upload a video",
    "Upload folder (batch)",
    "List my videos",
    "List my playlists",
    "Get video info",
    "Settings",
    "Exit",
];

/// Shown when tubecast runs without a subcommand. Esc counts as Exit.
pub fn main_menu() -> AppResult<MenuAction> {
    let choice = Select::new()
        .with_prompt("What would you like to do?")
        .items(MENU_ITEMS)
        .default(0)
        .interact_opt()?;

    let action = match choice {
        Some(0) => MenuAction::Upload(ask_path("Video file path", Path::is_file, "File not found")?),
        Some(1) => {
            let folder = ask_path("Folder with videos", Path::is_dir, "Folder not found")?;
            let ai = Confirm::new()
                .with_prompt("Use AI for metadata?")
                .default(false)
                .interact()?;
            MenuAction::Batch { folder, ai }
        }
        Some(2) => MenuAction::List,
        Some(3) => MenuAction::Playlists,
        Some(4) => {
            let id: String = Input::new().with_prompt("Video ID").interact_text()?;
            MenuAction::Info(id.trim().to_string())
        }
        Some(5) => MenuAction::Settings,
        _ => MenuAction::Exit,
    };
    Ok(action)
}

fn ask_path(prompt: &str, exists: fn(&Path) -> bool, missing: &'static str) -> AppResult<PathBuf> {
    let raw: String = Input::new()
        .with_prompt(prompt)
        .validate_with(move |input: &String| -> Result<(), &str> {
            if exists(Path::new(input.trim())) {
                Ok(())
            } else {
                Err(missing)
            }
        })
        .interact_text()?;
    Ok(PathBuf::from(raw.trim()))
}
