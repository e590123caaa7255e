use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Duration;

use crate::errors::{AppError, AppResult};
use crate::metadata::{GeneratedMetadata, MetadataGenerator};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

/// Metadata generation through the Gemini `generateContent` endpoint.
pub struct GeminiGenerator {
    client: Client,
    api_key: String,
    model: String,
    api_base: String,
    timeout: Duration,
}

impl GeminiGenerator {
    pub fn new(api_key: String, model: String, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            client: Client::builder().build()?,
            api_key,
            model,
            api_base: API_BASE.to_string(),
            timeout,
        })
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }
}

fn build_prompt(file_name: &str, context: &str) -> String {
    let context_line = if context.trim().is_empty() {
        String::new()
    } else {
        format!("Additional context: {}\n", context.trim())
    };

    format!(
        "You are a YouTube SEO expert. Generate optimized metadata for a video upload.\n\
         \n\
         Video filename: {file_name}\n\
         {context_line}\
         \n\
         Generate a JSON object with:\n\
         1. \"title\": Catchy, SEO-friendly title (max 100 chars, no clickbait)\n\
         2. \"description\": Detailed description with keywords (300-500 words), \
         relevant hashtags at the end and a call to action\n\
         3. \"tags\": List of 10-15 relevant keywords/phrases for discoverability\n\
         \n\
         Return ONLY valid JSON, no markdown or explanation.\n\
         Example format:\n\
         {{\"title\": \"...\", \"description\": \"...\", \"tags\": [\"tag1\", \"tag2\"]}}"
    )
}

/// Parses the model output, falling back to the outermost `{...}` span when
/// the JSON is wrapped in prose or code fences.
pub fn parse_generated(text: &str) -> AppResult<GeneratedMetadata> {
    if let Ok(parsed) = serde_json::from_str::<GeneratedMetadata>(text) {
        return Ok(parsed);
    }

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => serde_json::from_str(&text[start..=end])
            .map_err(|e| AppError::Generation(format!("Unparseable model output: {}", e))),
        _ => Err(AppError::Generation(format!(
            "Model output contained no JSON object: {}",
            text.chars().take(200).collect::<String>()
        ))),
    }
}

#[async_trait]
impl MetadataGenerator for GeminiGenerator {
    async fn generate(&self, file_name: &str, context: &str) -> AppResult<GeneratedMetadata> {
        let url = format!("{}/models/{}:generateContent", self.api_base, self.model);
        let body = json!({
            "contents": [{ "parts": [{ "text": build_prompt(file_name, context) }] }],
            "generationConfig": { "responseMimeType": "application/json" }
        });

        log::debug!("Requesting metadata for {} from {}", file_name, self.model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(match status.as_u16() {
                429 => AppError::RateLimit { retry_after_ms: 0 },
                code if status.is_server_error() => AppError::Server {
                    status: code,
                    message: error_text,
                },
                code => AppError::Generation(format!("Gemini API error {}: {}", code, error_text)),
            });
        }

        let parsed: GenerateResponse = response.json().await?;
        let text: String = parsed
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect();

        if text.trim().is_empty() {
            return Err(AppError::Generation("Empty response from Gemini".to_string()));
        }
        parse_generated(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_http::{respond_once, CannedResponse};

    fn generator(url: &str) -> GeminiGenerator {
        GeminiGenerator::new(
            "test-key".into(),
            "gemini-2.5-flash".into(),
            Duration::from_secs(5),
        )
        .unwrap()
        .with_api_base(url)
    }

    #[tokio::test]
    async fn test_generate_reads_candidate_text() {
        let body = json!({
            "candidates": [{
                "content": { "parts": [{
                    "text": "{\"title\":\"Beach day\",\"description\":\"Waves\",\"tags\":[\"beach\"]}"
                }]}
            }]
        })
        .to_string();
        let (url, server) = respond_once(CannedResponse::status(200).json(&body)).await;

        let generated = generator(&url)
            .generate("beach_day.mp4", "")
            .await
            .unwrap();
        assert_eq!(generated.title, "Beach day");
        assert_eq!(generated.tags, vec!["beach"]);

        let request = server.await.unwrap();
        assert!(
            request.starts_with("post /models/gemini-2.5-flash:generatecontent"),
            "{}",
            request
        );
        assert!(request.contains("x-goog-api-key: test-key"));
        assert!(request.contains("beach_day.mp4"));
    }

    #[tokio::test]
    async fn test_generate_maps_client_errors_to_generation_failure() {
        let (url, _server) =
            respond_once(CannedResponse::status(400).json(r#"{"error":{"message":"bad key"}}"#))
                .await;
        let result = generator(&url).generate("clip.mp4", "").await;
        assert!(matches!(result, Err(AppError::Generation(_))));
    }

    #[tokio::test]
    async fn test_generate_rejects_empty_candidates() {
        let (url, _server) =
            respond_once(CannedResponse::status(200).json(r#"{"candidates":[]}"#)).await;
        let result = generator(&url).generate("clip.mp4", "").await;
        assert!(matches!(result, Err(AppError::Generation(_))));
    }

    #[test]
    fn test_parses_plain_json() {
        let parsed =
            parse_generated(r#"{"title":"A","description":"B","tags":["x","y"]}"#).unwrap();
        assert_eq!(parsed.title, "A");
        assert_eq!(parsed.tags, vec!["x", "y"]);
    }

    #[test]
    fn test_extracts_json_wrapped_in_prose() {
        let text = "Here you go:\n```json\n{\"title\": \"Trip\", \"tags\": []}\n```\nEnjoy!";
        let parsed = parse_generated(text).unwrap();
        assert_eq!(parsed.title, "Trip");
        assert_eq!(parsed.description, "");
    }

    #[test]
    fn test_rejects_output_without_object() {
        assert!(matches!(
            parse_generated("I cannot help with that."),
            Err(AppError::Generation(_))
        ));
    }

    #[test]
    fn test_prompt_mentions_file_and_context() {
        let prompt = build_prompt("beach_day.mp4", "family vacation");
        assert!(prompt.contains("Video filename: beach_day.mp4"));
        assert!(prompt.contains("Additional context: family vacation"));
        assert!(!build_prompt("a.mp4", " ").contains("Additional context"));
    }
}
