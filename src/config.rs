use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{AppError, AppResult};
use crate::metadata::Privacy;
use crate::uploader::retry::RetryConfig;

/// Chunk boundaries must be aligned to this unit by the upload protocol.
pub const CHUNK_ALIGNMENT: u64 = 256 * 1024;

const APP_DIR_NAME: &str = "tubecast";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub default_privacy: Privacy,
    pub default_category: String,
    pub made_for_kids: bool,
    pub contains_synthetic_media: bool,
    pub ai_enabled: bool,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub chunk_size_mib: u64,
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub daily_quota_budget: u32,
    pub quota_timezone: String,
    pub request_timeout_secs: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_privacy: Privacy::Unlisted,
            default_category: "22".to_string(), // People & Blogs
            made_for_kids: false,
            contains_synthetic_media: true,
            ai_enabled: false,
            gemini_api_key: None,
            gemini_model: "gemini-2.5-flash".to_string(),
            chunk_size_mib: 8,
            max_retry_attempts: 5,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 60_000,
            daily_quota_budget: 10_000,
            quota_timezone: "America/Los_Angeles".to_string(),
            request_timeout_secs: 30,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mib * 1024 * 1024
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            ..RetryConfig::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// API key from the config file, falling back to `GEMINI_API_KEY`.
    pub fn gemini_key(&self) -> Option<String> {
        self.gemini_api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("GEMINI_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }

    pub fn timezone(&self) -> AppResult<chrono_tz::Tz> {
        self.quota_timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| AppError::validation("quota_timezone", "Must be an IANA timezone name"))
    }
}

/// Remote category identifiers offered by `setup`.
pub const CATEGORY_OPTIONS: &[(&str, &str)] = &[
    ("1", "Film & Animation"),
    ("2", "Autos & Vehicles"),
    ("10", "Music"),
    ("15", "Pets & Animals"),
    ("17", "Sports"),
    ("19", "Travel & Events"),
    ("20", "Gaming"),
    ("22", "People & Blogs"),
    ("23", "Comedy"),
    ("24", "Entertainment"),
    ("25", "News & Politics"),
    ("26", "Howto & Style"),
    ("27", "Education"),
    ("28", "Science & Technology"),
    ("29", "Nonprofits & Activism"),
];

pub const GEMINI_MODELS: &[(&str, &str)] = &[
    ("gemini-3-pro-preview", "Gemini 3 Pro Preview - latest and most capable"),
    ("gemini-2.5-pro", "Gemini 2.5 Pro - enhanced reasoning"),
    ("gemini-2.5-flash", "Gemini 2.5 Flash - fast and efficient"),
];

pub fn get_config_directory() -> AppResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| AppError::Config("Could not find config directory".to_string()))?
        .join(APP_DIR_NAME);

    fs::create_dir_all(&config_dir)?;
    Ok(config_dir)
}

fn get_config_path() -> AppResult<PathBuf> {
    Ok(get_config_directory()?.join("config.json"))
}

pub fn get_token_path() -> AppResult<PathBuf> {
    Ok(get_config_directory()?.join("token.json"))
}

pub fn get_data_directory() -> AppResult<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| AppError::Config("Could not find data directory".to_string()))?
        .join(APP_DIR_NAME);

    fs::create_dir_all(&data_dir)?;
    Ok(data_dir)
}

pub fn load_config() -> AppResult<Config> {
    load_config_from(&get_config_path()?)
}

pub fn load_config_from(config_path: &Path) -> AppResult<Config> {
    if config_path.exists() {
        let config_str = fs::read_to_string(config_path)?;
        let config: Config = serde_json::from_str(&config_str).unwrap_or_else(|e| {
            log::warn!("Failed to parse config file: {}. Using defaults.", e);
            Config::default()
        });

        validate_config(&config)?;

        Ok(config)
    } else {
        let default_config = Config::default();
        save_config_to(config_path, &default_config)?;
        Ok(default_config)
    }
}

pub fn save_config(config: &Config) -> AppResult<()> {
    validate_config(config)?;
    save_config_to(&get_config_path()?, config)
}

fn save_config_to(config_path: &Path, config: &Config) -> AppResult<()> {
    if config_path.exists() {
        let backup_path = config_path.with_extension("json.bak");
        if let Err(e) = fs::copy(config_path, &backup_path) {
            log::warn!("Failed to create config backup: {}", e);
        }
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let config_str = serde_json::to_string_pretty(config)?;
    fs::write(config_path, config_str)?;

    log::info!("Configuration saved to {}", config_path.display());
    Ok(())
}

pub fn validate_config(config: &Config) -> AppResult<()> {
    if config.chunk_size_mib == 0 || config.chunk_size_mib > 1024 {
        return Err(AppError::validation(
            "chunk_size_mib",
            "Must be between 1 and 1024",
        ));
    }

    // Whole MiB values are always 256 KiB aligned; guard anyway for future units.
    if config.chunk_size_bytes() % CHUNK_ALIGNMENT != 0 {
        return Err(AppError::validation(
            "chunk_size_mib",
            "Must be a multiple of 256 KiB",
        ));
    }

    if config.max_retry_attempts == 0 || config.max_retry_attempts > 20 {
        return Err(AppError::validation(
            "max_retry_attempts",
            "Must be between 1 and 20",
        ));
    }

    if config.retry_base_delay_ms > config.retry_max_delay_ms {
        return Err(AppError::validation(
            "retry_base_delay_ms",
            "Must not exceed retry_max_delay_ms",
        ));
    }

    if config.daily_quota_budget == 0 {
        return Err(AppError::validation(
            "daily_quota_budget",
            "Must be greater than 0",
        ));
    }

    if config.request_timeout_secs < 5 {
        return Err(AppError::validation(
            "request_timeout_secs",
            "Must be at least 5 seconds",
        ));
    }

    if !CATEGORY_OPTIONS
        .iter()
        .any(|(id, _)| *id == config.default_category)
    {
        return Err(AppError::validation(
            "default_category",
            "Unknown category id",
        ));
    }

    config.timezone()?;

    let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
    if !valid_log_levels.contains(&config.log_level.as_str()) {
        return Err(AppError::validation("log_level", "Must be a valid log level"));
    }

    Ok(())
}
