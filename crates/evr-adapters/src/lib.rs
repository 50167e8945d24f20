//! Candidate source contracts: the generative model client and a file-backed source.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use evr_core::{Category, RawEvent};
use evr_storage::{send_with_backoff, BackoffPolicy};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "evr-adapters";

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generated batch is not a JSON array of events: {reason}")]
    Malformed { reason: String, raw: String },
    #[error("model request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("model API error: HTTP {status}: {message}")]
    Api { status: u16, message: String },
    #[error("model returned no content")]
    EmptyResponse,
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl GenerationError {
    /// Offending text for malformed batches.
    pub fn raw_text(&self) -> Option<&str> {
        match self {
            GenerationError::Malformed { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

/// What to ask the model for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub count: usize,
    pub until: NaiveDate,
    pub categories: Vec<Category>,
}

impl GenerationRequest {
    pub fn new(count: usize, until: NaiveDate) -> Self {
        Self {
            count,
            until,
            categories: Category::KNOWN.to_vec(),
        }
    }

    pub fn prompt(&self) -> String {
        let categories = self
            .categories
            .iter()
            .map(Category::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "List {count} upcoming cultural, iconic or seasonal events from around the world \
             taking place between today and {until}.\n\
             Reply with a bare JSON array only: no markdown, no commentary.\n\
             Every element is an object with these keys:\n\
             - name (string)\n\
             - location (string, \"City, Country\")\n\
             - start_date (ISO 8601 date)\n\
             - end_date (ISO 8601 date)\n\
             - category (exactly one of: {categories})\n\
             - description (one or two sentences)\n\
             - image_url (string, optional; leave it out rather than guess)",
            count = self.count,
            until = self.until.format("%B %Y"),
        )
    }
}

/// One generation pass, before validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateBatch {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub raw_text: String,
    pub candidates: Vec<RawEvent>,
}

#[async_trait]
pub trait CandidateSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_batch(&self, request: &GenerationRequest) -> Result<CandidateBatch, GenerationError>;
}

/// Remove a surrounding markdown code fence (```` ```json ```` or bare ```` ``` ````).
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(idx) if rest[..idx].chars().all(|c| c.is_ascii_alphanumeric()) => &rest[idx + 1..],
        _ => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
    };
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Parse model output into raw candidates.
///
/// Tolerates code fences, prose around the array, and an object wrapping a
/// single array (`{"events": [...]}`). Anything else is [`GenerationError::Malformed`].
pub fn parse_candidate_batch(text: &str) -> Result<Vec<RawEvent>, GenerationError> {
    let body = strip_code_fences(text);
    let malformed = |reason: String| GenerationError::Malformed {
        reason,
        raw: text.to_string(),
    };

    let value = match serde_json::from_str::<JsonValue>(body) {
        Ok(value) => value,
        Err(err) => match (body.find('['), body.rfind(']')) {
            (Some(start), Some(end)) if start < end => {
                serde_json::from_str::<JsonValue>(&body[start..=end])
                    .map_err(|_| malformed(err.to_string()))?
            }
            _ => return Err(malformed(err.to_string())),
        },
    };

    match value {
        JsonValue::Array(items) => Ok(items.into_iter().map(RawEvent::new).collect()),
        JsonValue::Object(map) => {
            let mut arrays = map.into_iter().filter_map(|(_, v)| match v {
                JsonValue::Array(items) => Some(items),
                _ => None,
            });
            match (arrays.next(), arrays.next()) {
                (Some(items), None) => Ok(items.into_iter().map(RawEvent::new).collect()),
                _ => Err(malformed("object does not wrap exactly one array".to_string())),
            }
        }
        other => Err(malformed(format!("expected an array, found {}", json_kind(&other)))),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl ChatConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4".to_string(),
            temperature: 0.7,
            timeout: Duration::from_secs(120),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// OpenAI-compatible chat-completions client.
#[derive(Debug)]
pub struct ChatCompletionSource {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    backoff: BackoffPolicy,
}

impl ChatCompletionSource {
    pub fn new(config: ChatConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key,
            model: config.model,
            temperature: config.temperature,
            backoff: config.backoff,
        })
    }

    fn extract_content(response: &JsonValue) -> Result<String, GenerationError> {
        response["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
            .ok_or(GenerationError::EmptyResponse)
    }

    fn api_error(status: u16, body: &str) -> GenerationError {
        let message = serde_json::from_str::<JsonValue>(body)
            .ok()
            .and_then(|v| v["error"]["message"].as_str().map(ToOwned::to_owned))
            .unwrap_or_else(|| body.to_string());
        GenerationError::Api { status, message }
    }
}

#[async_trait]
impl CandidateSource for ChatCompletionSource {
    fn source_id(&self) -> &'static str {
        "chat-completions"
    }

    async fn fetch_batch(&self, request: &GenerationRequest) -> Result<CandidateBatch, GenerationError> {
        let payload = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": request.prompt()}],
            "temperature": self.temperature,
        });

        let span = info_span!("generate_candidates", model = %self.model, count = request.count);
        async {
            let resp = send_with_backoff(&self.backoff, || {
                self.client
                    .post(&self.endpoint)
                    .bearer_auth(&self.api_key)
                    .json(&payload)
            })
            .await?;

            let status = resp.status();
            let body = resp.text().await?;
            if !status.is_success() {
                return Err(Self::api_error(status.as_u16(), &body));
            }

            let response: JsonValue = serde_json::from_str(&body).map_err(|err| {
                GenerationError::Api {
                    status: status.as_u16(),
                    message: format!("undecodable completion envelope: {err}"),
                }
            })?;
            let content = Self::extract_content(&response)?;
            debug!(bytes = content.len(), "model replied");
            let candidates = parse_candidate_batch(&content)?;

            Ok::<CandidateBatch, GenerationError>(CandidateBatch {
                source_id: self.source_id().to_string(),
                fetched_at: Utc::now(),
                raw_text: content,
                candidates,
            })
        }
        .instrument(span)
        .await
    }
}

/// Reads a previously captured batch from disk instead of calling the model.
#[derive(Debug, Clone)]
pub struct FileCandidateSource {
    path: PathBuf,
}

impl FileCandidateSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CandidateSource for FileCandidateSource {
    fn source_id(&self) -> &'static str {
        "candidates-file"
    }

    async fn fetch_batch(&self, _request: &GenerationRequest) -> Result<CandidateBatch, GenerationError> {
        let raw_text = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let candidates = parse_candidate_batch(&raw_text)?;
        Ok(CandidateBatch {
            source_id: self.source_id().to_string(),
            fetched_at: Utc::now(),
            raw_text,
            candidates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BATCH: &str = r#"[
        {"name": "Lantern Festival", "location": "Taipei, Taiwan", "start_date": "2026-02-01",
         "end_date": "2026-02-03", "category": "Culture", "description": "Lanterns."},
        {"name": "Holi", "location": "Mathura, India", "start_date": "2026-03-04",
         "end_date": "2026-03-04", "category": "Culture", "description": "Colours."}
    ]"#;

    fn source_for(server: &MockServer) -> ChatCompletionSource {
        let mut config = ChatConfig::new("test-key");
        config.base_url = server.uri();
        config.backoff = BackoffPolicy::none();
        ChatCompletionSource::new(config).expect("source")
    }

    fn completion(content: &str) -> JsonValue {
        json!({
            "id": "chatcmpl-test",
            "object": "chat.completion",
            "model": "gpt-4",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }]
        })
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new(12, NaiveDate::from_ymd_opt(2026, 7, 31).unwrap())
    }

    #[test]
    fn strips_json_and_bare_fences() {
        assert_eq!(strip_code_fences("```json\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fences("```\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fences("```json[1]```"), "[1]");
        assert_eq!(strip_code_fences("  [1]  "), "[1]");
    }

    #[test]
    fn parses_fenced_batch() {
        let fenced = format!("```json\n{BATCH}\n```");
        let candidates = parse_candidate_batch(&fenced).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].text("name"), Some("Lantern Festival"));
    }

    #[test]
    fn tolerates_prose_around_the_array() {
        let noisy = format!("Sure! Here are the events:\n{BATCH}\nEnjoy.");
        assert_eq!(parse_candidate_batch(&noisy).unwrap().len(), 2);
    }

    #[test]
    fn unwraps_single_array_object() {
        let wrapped = format!(r#"{{"events": {BATCH}}}"#);
        assert_eq!(parse_candidate_batch(&wrapped).unwrap().len(), 2);
    }

    #[test]
    fn malformed_output_keeps_raw_text() {
        let err = parse_candidate_batch("I'm sorry, I can't list future events.").unwrap_err();
        assert!(matches!(err, GenerationError::Malformed { .. }));
        assert_eq!(err.raw_text(), Some("I'm sorry, I can't list future events."));

        let err = parse_candidate_batch(r#""just a string""#).unwrap_err();
        assert!(err.to_string().contains("a string"));
    }

    #[test]
    fn non_object_elements_survive_parsing() {
        let candidates = parse_candidate_batch(r#"[{"name": "A"}, "B", 3]"#).unwrap();
        assert_eq!(candidates.len(), 3);
        assert!(candidates[1].as_object().is_none());
    }

    #[test]
    fn prompt_names_count_horizon_and_categories() {
        let prompt = request().prompt();
        assert!(prompt.contains("List 12 upcoming"));
        assert!(prompt.contains("July 2026"));
        assert!(prompt.contains("Culture, Seasonal, Music, Arts, Iconic, Nature, Sports"));
    }

    #[tokio::test]
    async fn chat_source_returns_parsed_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion(&format!("```json\n{BATCH}\n```"))),
            )
            .expect(1)
            .mount(&server)
            .await;

        let batch = source_for(&server).fetch_batch(&request()).await.expect("batch");
        assert_eq!(batch.source_id, "chat-completions");
        assert_eq!(batch.candidates.len(), 2);
        assert!(batch.raw_text.starts_with("```json"));
    }

    #[tokio::test]
    async fn chat_source_surfaces_malformed_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("[{\"name\": ")))
            .mount(&server)
            .await;

        let err = source_for(&server).fetch_batch(&request()).await.unwrap_err();
        assert_eq!(err.raw_text(), Some("[{\"name\":"));
    }

    #[tokio::test]
    async fn chat_source_maps_api_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Incorrect API key", "type": "invalid_request_error"}
            })))
            .mount(&server)
            .await;

        let err = source_for(&server).fetch_batch(&request()).await.unwrap_err();
        match err {
            GenerationError::Api { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Incorrect API key");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn chat_source_rejects_empty_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("   ")))
            .mount(&server)
            .await;

        let err = source_for(&server).fetch_batch(&request()).await.unwrap_err();
        assert!(matches!(err, GenerationError::EmptyResponse));
    }

    #[tokio::test]
    async fn file_source_reads_captured_batch() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(BATCH.as_bytes()).expect("write");

        let source = FileCandidateSource::new(file.path());
        let batch = source.fetch_batch(&request()).await.expect("batch");
        assert_eq!(batch.source_id, "candidates-file");
        assert_eq!(batch.candidates.len(), 2);
    }

    #[tokio::test]
    async fn file_source_reports_missing_file() {
        let source = FileCandidateSource::new("/nonexistent/candidates.json");
        let err = source.fetch_batch(&request()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Anyhow(_)));
    }
}
