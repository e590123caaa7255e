// Video metadata and the layered resolution used before every upload.
//
// Precedence is sidecar file, then AI generation, then manual input (or the
// file-name defaults when nobody is around to answer prompts). Explicit
// command-line values are applied on top of whichever source won, and a
// prompt, when shown, starts from that result.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::errors::{AppError, AppResult};
use crate::media::{MediaItem, SidecarMetadata};
use crate::security::InputValidator;
use crate::uploader::retry::RetryPolicy;

/// Generated tag lists are capped at this many entries.
pub const MAX_GENERATED_TAGS: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    Public,
    #[default]
    Unlisted,
    Private,
}

impl Privacy {
    pub const ALL: [Privacy; 3] = [Privacy::Public, Privacy::Unlisted, Privacy::Private];

    pub fn as_str(&self) -> &'static str {
        match self {
            Privacy::Public => "public",
            Privacy::Unlisted => "unlisted",
            Privacy::Private => "private",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Privacy::Public => "Anyone can watch",
            Privacy::Unlisted => "Only people with the link can watch",
            Privacy::Private => "Only you can watch",
        }
    }
}

impl fmt::Display for Privacy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Privacy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "public" => Ok(Privacy::Public),
            "unlisted" => Ok(Privacy::Unlisted),
            "private" => Ok(Privacy::Private),
            _ => Err(AppError::validation(
                "privacy",
                "Must be 'public', 'unlisted' or 'private'",
            )),
        }
    }
}

/// Ordered set of tags: insertion order is kept and duplicates are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(Vec<String>);

impl Tags {
    pub fn insert(&mut self, tag: &str) -> bool {
        let tag = tag.trim();
        if tag.is_empty() || self.0.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            return false;
        }
        self.0.push(tag.to_string());
        true
    }

    pub fn from_comma_separated(raw: &str) -> Self {
        raw.split(',').map(str::to_string).collect()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }

    pub fn pop(&mut self) -> Option<String> {
        self.0.pop()
    }

    /// Length as counted by the remote service: separators count, and tags
    /// containing spaces are quoted.
    pub fn total_chars(&self) -> usize {
        let body: usize = self
            .0
            .iter()
            .map(|t| t.chars().count() + if t.contains(' ') { 2 } else { 0 })
            .sum();
        body + self.0.len().saturating_sub(1)
    }

    pub fn joined(&self) -> String {
        self.0.join(", ")
    }
}

impl FromIterator<String> for Tags {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut tags = Tags::default();
        for tag in iter {
            tags.insert(&tag);
        }
        tags
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub title: String,
    pub description: String,
    pub tags: Tags,
    pub privacy: Privacy,
    pub category: String,
    pub made_for_kids: bool,
    pub contains_synthetic_media: bool,
}

/// Values that apply when a source leaves a field unset.
#[derive(Debug, Clone)]
pub struct MetadataDefaults {
    pub privacy: Privacy,
    pub category: String,
    pub made_for_kids: bool,
    pub contains_synthetic_media: bool,
}

impl From<&Config> for MetadataDefaults {
    fn from(config: &Config) -> Self {
        Self {
            privacy: config.default_privacy,
            category: config.default_category.clone(),
            made_for_kids: config.made_for_kids,
            contains_synthetic_media: config.contains_synthetic_media,
        }
    }
}

impl Default for MetadataDefaults {
    fn default() -> Self {
        (&Config::default()).into()
    }
}

impl MetadataDefaults {
    /// Title from the file stem, everything else empty.
    pub fn for_item(&self, item: &MediaItem) -> Metadata {
        Metadata {
            title: InputValidator::sanitize_title(&item.file_stem()),
            description: String::new(),
            tags: Tags::default(),
            privacy: self.privacy,
            category: self.category.clone(),
            made_for_kids: self.made_for_kids,
            contains_synthetic_media: self.contains_synthetic_media,
        }
    }
}

/// Values given explicitly on the command line.
#[derive(Debug, Clone, Default)]
pub struct MetadataOverrides {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Tags>,
    pub privacy: Option<Privacy>,
    pub category: Option<String>,
}

impl MetadataOverrides {
    pub fn apply(&self, metadata: &mut Metadata) {
        if let Some(title) = &self.title {
            metadata.title = title.clone();
        }
        if let Some(description) = &self.description {
            metadata.description = description.clone();
        }
        if let Some(tags) = &self.tags {
            metadata.tags = tags.clone();
        }
        if let Some(privacy) = self.privacy {
            metadata.privacy = privacy;
        }
        if let Some(category) = &self.category {
            metadata.category = category.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct GeneratedMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Text-generation provider that proposes metadata for a file.
#[async_trait]
pub trait MetadataGenerator: Send + Sync {
    async fn generate(&self, file_name: &str, context: &str) -> AppResult<GeneratedMetadata>;
}

/// Interactive source of metadata, asked last.
pub trait ManualMetadataSource: Send + Sync {
    fn prompt(&self, item: &MediaItem, suggestion: Metadata) -> AppResult<Metadata>;
}

/// When the manual source is consulted for an item without a sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptWhen {
    /// Only when generation is unavailable or failed.
    Fallback,
    /// Every time, prefilled with whatever generation produced.
    Always,
}

/// Produces the metadata an item is submitted with.
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve(&self, item: &MediaItem) -> AppResult<Metadata>;
}

pub struct LayeredResolver {
    defaults: MetadataDefaults,
    overrides: MetadataOverrides,
    generator: Option<Arc<dyn MetadataGenerator>>,
    manual: Option<(Arc<dyn ManualMetadataSource>, PromptWhen)>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    context: String,
}

impl LayeredResolver {
    pub fn new(defaults: MetadataDefaults, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            defaults,
            overrides: MetadataOverrides::default(),
            generator: None,
            manual: None,
            retry,
            cancel,
            context: String::new(),
        }
    }

    pub fn with_overrides(mut self, overrides: MetadataOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn MetadataGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_manual(mut self, manual: Arc<dyn ManualMetadataSource>, when: PromptWhen) -> Self {
        self.manual = Some((manual, when));
        self
    }

    /// Free-form hint passed to the generator along with the file name.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    fn from_sidecar(&self, item: &MediaItem, sidecar: &SidecarMetadata) -> Metadata {
        let mut metadata = self.defaults.for_item(item);
        if let Some(title) = &sidecar.title {
            // An explicit but empty title stays empty and fails validation.
            metadata.title = title.trim().to_string();
        }
        if let Some(description) = &sidecar.description {
            metadata.description = description.clone();
        }
        metadata.tags = sidecar.tags();
        if let Some(privacy) = sidecar.privacy {
            metadata.privacy = privacy;
        }
        if let Some(category) = &sidecar.category {
            metadata.category = category.clone();
        }
        metadata
    }

    async fn from_generator(
        &self,
        item: &MediaItem,
        generator: &Arc<dyn MetadataGenerator>,
    ) -> AppResult<Metadata> {
        let file_name = item.file_name();
        let generated = self
            .retry
            .execute(|| generator.generate(&file_name, &self.context), &self.cancel)
            .await?;

        let mut metadata = self.defaults.for_item(item);
        let title = InputValidator::sanitize_title(&generated.title);
        if !title.is_empty() {
            metadata.title = title;
        }
        metadata.description = InputValidator::sanitize_description(&generated.description);
        metadata.tags = InputValidator::sanitize_tags(generated.tags, MAX_GENERATED_TAGS);
        Ok(metadata)
    }
}

#[async_trait]
impl MetadataResolver for LayeredResolver {
    async fn resolve(&self, item: &MediaItem) -> AppResult<Metadata> {
        if let Some(reason) = &item.sidecar_error {
            return Err(AppError::validation("sidecar", reason));
        }

        if let Some(sidecar) = &item.sidecar {
            log::debug!("Using sidecar metadata for {}", item.path.display());
            let mut metadata = self.from_sidecar(item, sidecar);
            self.overrides.apply(&mut metadata);
            InputValidator::validate_metadata(&metadata)?;
            return Ok(metadata);
        }

        let mut generated = None;
        if let Some(generator) = &self.generator {
            match self.from_generator(item, generator).await {
                Ok(metadata) => generated = Some(metadata),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => log::warn!(
                    "AI generation failed for {}, falling back to manual metadata: {}",
                    item.path.display(),
                    e
                ),
            }
        }

        let ask = match &self.manual {
            Some((manual, PromptWhen::Always)) => Some(manual),
            Some((manual, PromptWhen::Fallback)) if generated.is_none() => Some(manual),
            _ => None,
        };

        let mut metadata = generated.unwrap_or_else(|| self.defaults.for_item(item));
        self.overrides.apply(&mut metadata);
        // Answers typed at the prompt win over command-line values.
        if let Some(manual) = ask {
            metadata = manual.prompt(item, metadata)?;
        }

        InputValidator::validate_metadata(&metadata)?;
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::retry::RetryConfig;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct StubGenerator {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl MetadataGenerator for StubGenerator {
        async fn generate(&self, file_name: &str, _context: &str) -> AppResult<GeneratedMetadata> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AppError::Generation("model unavailable".into()));
            }
            Ok(GeneratedMetadata {
                title: format!("AI title for {}", file_name),
                description: "generated".into(),
                tags: (0..20).map(|i| format!("t{}", i)).collect(),
            })
        }
    }

    /// Records the suggestion it was shown and answers with a fixed title.
    struct ScriptedAnswers {
        title: String,
        seen: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedAnswers {
        fn new(title: &str) -> Arc<Self> {
            Arc::new(Self {
                title: title.to_string(),
                seen: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl ManualMetadataSource for ScriptedAnswers {
        fn prompt(&self, _item: &MediaItem, suggestion: Metadata) -> AppResult<Metadata> {
            self.seen.lock().unwrap().push(suggestion.title.clone());
            Ok(Metadata {
                title: self.title.clone(),
                ..suggestion
            })
        }
    }

    /// Returns the maximum tag count, each tag long enough to blow the length budget.
    struct WordyGenerator;

    #[async_trait]
    impl MetadataGenerator for WordyGenerator {
        async fn generate(&self, _file_name: &str, _context: &str) -> AppResult<GeneratedMetadata> {
            Ok(GeneratedMetadata {
                title: "Road trip".into(),
                description: "A drive along the coast".into(),
                tags: (0..MAX_GENERATED_TAGS)
                    .map(|i| format!("scenic coastal highway road trip {:02}", i))
                    .collect(),
            })
        }
    }

    fn item(name: &str, sidecar: Option<SidecarMetadata>) -> MediaItem {
        MediaItem {
            path: PathBuf::from(format!("/videos/{}", name)),
            size: 1024,
            content_type: "video/mp4".into(),
            sidecar,
            sidecar_error: None,
        }
    }

    fn resolver() -> LayeredResolver {
        let retry = RetryPolicy::new(RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..RetryConfig::default()
        });
        LayeredResolver::new(MetadataDefaults::default(), retry, CancellationToken::new())
    }

    #[test]
    fn test_tags_keep_order_and_drop_duplicates() {
        let tags = Tags::from_comma_separated(" rust, video ,Rust,, tutorial ");
        assert_eq!(tags.as_slice(), &["rust", "video", "tutorial"]);
        assert_eq!(tags.total_chars(), 4 + 5 + 8 + 2);
    }

    #[test]
    fn test_privacy_parsing() {
        assert_eq!("PUBLIC".parse::<Privacy>().unwrap(), Privacy::Public);
        assert!("friends".parse::<Privacy>().is_err());
    }

    #[tokio::test]
    async fn test_sidecar_takes_precedence_over_generator() {
        let generator = Arc::new(StubGenerator {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let resolver = resolver().with_generator(generator.clone());
        let sidecar = SidecarMetadata {
            title: Some("From sidecar".into()),
            tags: Some(crate::media::TagField::Text("a,b".into())),
            ..SidecarMetadata::default()
        };

        let metadata = resolver.resolve(&item("one.mp4", Some(sidecar))).await.unwrap();
        assert_eq!(metadata.title, "From sidecar");
        assert_eq!(metadata.tags.as_slice(), &["a", "b"]);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_generator_used_without_sidecar() {
        let generator = Arc::new(StubGenerator {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let resolver = resolver().with_generator(generator);

        let metadata = resolver.resolve(&item("two.mp4", None)).await.unwrap();
        assert_eq!(metadata.title, "AI title for two.mp4");
        assert_eq!(metadata.tags.len(), MAX_GENERATED_TAGS);
    }

    #[tokio::test]
    async fn test_long_generated_tags_are_trimmed_not_rejected() {
        let resolver = resolver().with_generator(Arc::new(WordyGenerator));

        let metadata = resolver.resolve(&item("coast.mp4", None)).await.unwrap();
        assert_eq!(metadata.title, "Road trip");
        assert!(!metadata.tags.is_empty());
        assert!(metadata.tags.len() < MAX_GENERATED_TAGS);
        assert!(metadata.tags.total_chars() <= crate::security::MAX_TAGS_TOTAL_CHARS);
        assert_eq!(
            metadata.tags.as_slice()[0],
            "scenic coastal highway road trip 00"
        );
    }

    #[tokio::test]
    async fn test_generator_failure_falls_back_to_defaults() {
        let generator = Arc::new(StubGenerator {
            calls: AtomicU32::new(0),
            fail: true,
        });
        let resolver = resolver().with_generator(generator.clone());

        let metadata = resolver.resolve(&item("my_trip.mp4", None)).await.unwrap();
        assert_eq!(metadata.title, "my_trip");
        // Generation errors are terminal, so the retry policy makes one attempt.
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_generation_falls_back_to_prompt() {
        let generator = Arc::new(StubGenerator {
            calls: AtomicU32::new(0),
            fail: true,
        });
        let answers = ScriptedAnswers::new("Typed title");
        let resolver = resolver()
            .with_generator(generator)
            .with_manual(answers.clone(), PromptWhen::Fallback);

        let metadata = resolver.resolve(&item("my_trip.mp4", None)).await.unwrap();
        assert_eq!(metadata.title, "Typed title");
        assert_eq!(answers.seen(), vec!["my_trip".to_string()]);
    }

    #[tokio::test]
    async fn test_fallback_prompt_skipped_when_generation_works() {
        let generator = Arc::new(StubGenerator {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let answers = ScriptedAnswers::new("Typed title");
        let resolver = resolver()
            .with_generator(generator)
            .with_manual(answers.clone(), PromptWhen::Fallback);

        let metadata = resolver.resolve(&item("two.mp4", None)).await.unwrap();
        assert_eq!(metadata.title, "AI title for two.mp4");
        assert!(answers.seen().is_empty());
    }

    #[tokio::test]
    async fn test_always_prompt_reviews_generated_values() {
        let generator = Arc::new(StubGenerator {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let answers = ScriptedAnswers::new("Edited");
        let resolver = resolver()
            .with_generator(generator)
            .with_manual(answers.clone(), PromptWhen::Always);

        let metadata = resolver.resolve(&item("two.mp4", None)).await.unwrap();
        assert_eq!(metadata.title, "Edited");
        assert_eq!(answers.seen(), vec!["AI title for two.mp4".to_string()]);
        assert_eq!(metadata.tags.len(), MAX_GENERATED_TAGS);
    }

    #[tokio::test]
    async fn test_prompt_is_prefilled_with_overrides() {
        let answers = ScriptedAnswers::new("Final");
        let resolver = resolver()
            .with_overrides(MetadataOverrides {
                title: Some("From flag".into()),
                privacy: Some(Privacy::Private),
                ..MetadataOverrides::default()
            })
            .with_manual(answers.clone(), PromptWhen::Always);

        let metadata = resolver.resolve(&item("five.mp4", None)).await.unwrap();
        assert_eq!(answers.seen(), vec!["From flag".to_string()]);
        assert_eq!(metadata.title, "Final");
        assert_eq!(metadata.privacy, Privacy::Private);
    }

    #[tokio::test]
    async fn test_sidecar_is_never_prompted() {
        let answers = ScriptedAnswers::new("Typed title");
        let resolver = resolver().with_manual(answers.clone(), PromptWhen::Always);
        let sidecar = SidecarMetadata {
            title: Some("From sidecar".into()),
            ..SidecarMetadata::default()
        };

        let metadata = resolver.resolve(&item("six.mp4", Some(sidecar))).await.unwrap();
        assert_eq!(metadata.title, "From sidecar");
        assert!(answers.seen().is_empty());
    }

    #[tokio::test]
    async fn test_empty_sidecar_title_is_rejected() {
        let sidecar = SidecarMetadata {
            title: Some("   ".into()),
            ..SidecarMetadata::default()
        };
        let result = resolver().resolve(&item("three.mp4", Some(sidecar))).await;
        assert!(matches!(result, Err(AppError::Validation { ref field, .. }) if field == "title"));
    }

    #[tokio::test]
    async fn test_overrides_win() {
        let resolver = resolver().with_overrides(MetadataOverrides {
            title: Some("Explicit".into()),
            privacy: Some(Privacy::Private),
            ..MetadataOverrides::default()
        });
        let metadata = resolver.resolve(&item("four.mp4", None)).await.unwrap();
        assert_eq!(metadata.title, "Explicit");
        assert_eq!(metadata.privacy, Privacy::Private);
    }
}
