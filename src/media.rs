use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

use crate::errors::{AppError, AppResult};
use crate::metadata::{Privacy, Tags};
use crate::security::{InputValidator, VIDEO_EXTENSIONS};

/// A local video file discovered for upload.
#[derive(Debug, Clone)]
pub struct MediaItem {
    pub path: PathBuf,
    pub size: u64,
    pub content_type: String,
    pub sidecar: Option<SidecarMetadata>,
    /// Set when a sidecar exists but could not be parsed.
    pub sidecar_error: Option<String>,
}

/// `tags` may be written either as `"a, b, c"` or as `["a", "b", "c"]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TagField {
    Text(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SidecarMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<TagField>,
    pub privacy: Option<Privacy>,
    pub category: Option<String>,
}

impl SidecarMetadata {
    pub fn tags(&self) -> Tags {
        match &self.tags {
            Some(TagField::Text(raw)) => Tags::from_comma_separated(raw),
            Some(TagField::List(list)) => list.iter().cloned().collect(),
            None => Tags::default(),
        }
    }
}

pub fn content_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_string_lossy().to_lowercase();
    match ext.as_str() {
        "mp4" => Some("video/mp4"),
        "mkv" => Some("video/x-matroska"),
        "mov" => Some("video/quicktime"),
        "webm" => Some("video/webm"),
        "avi" => Some("video/x-msvideo"),
        _ => None,
    }
}

pub fn sidecar_path(path: &Path) -> PathBuf {
    path.with_extension("json")
}

impl MediaItem {
    pub fn from_path(path: &Path) -> AppResult<Self> {
        let path_str = path.to_string_lossy();
        let size = InputValidator::validate_video_file(&path_str)?;
        let content_type = content_type_for(path)
            .ok_or_else(|| AppError::invalid_file_type(&path_str))?
            .to_string();

        let (sidecar, sidecar_error) = match read_sidecar(path) {
            Ok(sidecar) => (sidecar, None),
            Err(e) => {
                log::warn!("Ignoring unreadable sidecar for {}: {}", path.display(), e);
                (None, Some(format!("unreadable sidecar: {}", e)))
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            size,
            content_type,
            sidecar,
            sidecar_error,
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string()
    }

    pub fn file_stem(&self) -> String {
        self.path
            .file_stem()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string()
    }
}

fn read_sidecar(path: &Path) -> AppResult<Option<SidecarMetadata>> {
    let sidecar = sidecar_path(path);
    if !sidecar.is_file() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&sidecar)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

/// Video files directly inside `folder`, ordered by file name.
pub fn discover(folder: &Path) -> AppResult<Vec<MediaItem>> {
    if !folder.is_dir() {
        return Err(AppError::validation("folder", "Folder not found"));
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(folder)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .map(|e| VIDEO_EXTENSIONS.contains(&e.to_string_lossy().to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    paths.sort_by_key(|p| p.file_name().map(|n| n.to_os_string()));

    let mut items = Vec::with_capacity(paths.len());
    for path in paths {
        match MediaItem::from_path(&path) {
            Ok(item) => items.push(item),
            Err(e) => log::warn!("Skipping {}: {}", path.display(), e),
        }
    }

    log::info!("Discovered {} video(s) in {}", items.len(), folder.display());
    Ok(items)
}

/// SHA-256 of the whole file, hex encoded.
pub async fn get_file_hash(path: &Path) -> AppResult<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(Path::new("a.MKV")), Some("video/x-matroska"));
        assert_eq!(content_type_for(Path::new("a.mov")), Some("video/quicktime"));
        assert_eq!(content_type_for(Path::new("a.gif")), None);
    }

    #[test]
    fn test_discover_orders_and_reads_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.mp4"), b"bbbb").unwrap();
        fs::write(dir.path().join("a.mov"), b"aa").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        fs::write(dir.path().join("empty.mkv"), b"").unwrap();
        fs::write(
            dir.path().join("a.json"),
            r#"{"title": "First", "tags": "x, y"}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("b.json"),
            r#"{"tags": ["p", "q"], "privacy": "private"}"#,
        )
        .unwrap();

        let items = discover(dir.path()).unwrap();
        let names: Vec<String> = items.iter().map(|i| i.file_name()).collect();
        assert_eq!(names, vec!["a.mov", "b.mp4"]);

        let first = items[0].sidecar.as_ref().unwrap();
        assert_eq!(first.title.as_deref(), Some("First"));
        assert_eq!(first.tags().as_slice(), &["x", "y"]);

        let second = items[1].sidecar.as_ref().unwrap();
        assert_eq!(second.privacy, Some(Privacy::Private));
        assert_eq!(second.tags().as_slice(), &["p", "q"]);
        assert_eq!(items[1].size, 4);
    }

    #[test]
    fn test_malformed_sidecar_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("clip.mp4");
        fs::write(&video, b"data").unwrap();
        fs::write(dir.path().join("clip.json"), b"{not json").unwrap();

        let item = MediaItem::from_path(&video).unwrap();
        assert!(item.sidecar.is_none());
        assert!(item.sidecar_error.is_some());
    }

    #[tokio::test]
    async fn test_file_hash_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("clip.mp4");
        fs::write(&video, b"abc").unwrap();

        let hash = get_file_hash(&video).await.unwrap();
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
