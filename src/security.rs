use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

use crate::errors::{AppError, AppResult};
use crate::metadata::{Metadata, Tags};

pub const MAX_TITLE_CHARS: usize = 100;
pub const MAX_DESCRIPTION_BYTES: usize = 5000;
pub const MAX_TAGS_TOTAL_CHARS: usize = 500;

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "mov", "webm", "avi"];

fn video_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("static video id pattern"))
}

fn playlist_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{10,64}$").expect("static playlist id pattern"))
}

pub struct InputValidator;

impl InputValidator {
    pub fn validate_file_path(path: &str) -> AppResult<()> {
        if path.trim().is_empty() {
            return Err(AppError::validation("file_path", "File path cannot be empty"));
        }

        let path_obj = Path::new(path);

        match path_obj.extension() {
            Some(extension) => {
                let ext = extension.to_string_lossy().to_lowercase();
                if !VIDEO_EXTENSIONS.contains(&ext.as_str()) {
                    return Err(AppError::invalid_file_type(path));
                }
            }
            None => {
                return Err(AppError::validation("file_path", "File must have an extension"));
            }
        }

        if !path_obj.exists() {
            return Err(AppError::file_not_found(path));
        }

        if !path_obj.is_file() {
            return Err(AppError::validation("file_path", "Path is not a file"));
        }

        Ok(())
    }

    pub fn validate_video_file(file_path: &str) -> AppResult<u64> {
        Self::validate_file_path(file_path)?;

        let size = std::fs::metadata(file_path)?.len();
        if size == 0 {
            return Err(AppError::validation("file_path", "File is empty"));
        }

        Ok(size)
    }

    pub fn validate_title(title: &str) -> AppResult<()> {
        let trimmed = title.trim();

        if trimmed.is_empty() {
            return Err(AppError::validation("title", "Title cannot be empty"));
        }

        if trimmed.chars().count() > MAX_TITLE_CHARS {
            return Err(AppError::validation(
                "title",
                "Title too long (max 100 characters)",
            ));
        }

        if trimmed.contains('<') || trimmed.contains('>') {
            return Err(AppError::validation("title", "Title cannot contain '<' or '>'"));
        }

        Ok(())
    }

    /// Checks everything the remote service would reject, before any quota is spent.
    pub fn validate_metadata(metadata: &Metadata) -> AppResult<()> {
        Self::validate_title(&metadata.title)?;

        if metadata.description.len() > MAX_DESCRIPTION_BYTES {
            return Err(AppError::validation(
                "description",
                "Description too long (max 5000 bytes)",
            ));
        }

        if metadata.description.contains('<') || metadata.description.contains('>') {
            return Err(AppError::validation(
                "description",
                "Description cannot contain '<' or '>'",
            ));
        }

        if metadata
            .tags
            .as_slice()
            .iter()
            .any(|t| t.contains('<') || t.contains('>'))
        {
            return Err(AppError::validation("tags", "Tags cannot contain '<' or '>'"));
        }

        if metadata.tags.total_chars() > MAX_TAGS_TOTAL_CHARS {
            return Err(AppError::validation(
                "tags",
                "Combined tag length exceeds 500 characters",
            ));
        }

        if metadata.category.trim().is_empty() {
            return Err(AppError::validation("category", "Category cannot be empty"));
        }

        Ok(())
    }

    /// Cleans generated text so it satisfies the title rules.
    pub fn sanitize_title(title: &str) -> String {
        let cleaned: String = title
            .trim()
            .chars()
            .filter(|c| *c != '<' && *c != '>' && !c.is_control())
            .collect();
        cleaned.chars().take(MAX_TITLE_CHARS).collect::<String>().trim().to_string()
    }

    pub fn sanitize_description(description: &str) -> String {
        let mut cleaned: String = description.replace(['<', '>'], "");
        if cleaned.len() > MAX_DESCRIPTION_BYTES {
            let mut cut = MAX_DESCRIPTION_BYTES;
            while !cleaned.is_char_boundary(cut) {
                cut -= 1;
            }
            cleaned.truncate(cut);
        }
        cleaned
    }

    /// Cleans generated tags: angle brackets go, at most `max_count` are kept,
    /// then trailing tags are dropped until the combined length fits.
    pub fn sanitize_tags(raw: Vec<String>, max_count: usize) -> Tags {
        let mut tags: Tags = raw
            .into_iter()
            .map(|tag| {
                tag.chars()
                    .filter(|c| *c != '<' && *c != '>' && !c.is_control())
                    .collect::<String>()
            })
            .collect();
        tags.truncate(max_count);
        while tags.total_chars() > MAX_TAGS_TOTAL_CHARS {
            tags.pop();
        }
        tags
    }

    pub fn validate_video_id(video_id: &str) -> AppResult<()> {
        if !video_id_pattern().is_match(video_id.trim()) {
            return Err(AppError::validation("video_id", "Not a valid video id"));
        }
        Ok(())
    }

    pub fn validate_playlist_id(playlist_id: &str) -> AppResult<()> {
        if !playlist_id_pattern().is_match(playlist_id.trim()) {
            return Err(AppError::validation("playlist_id", "Not a valid playlist id"));
        }
        Ok(())
    }
}
