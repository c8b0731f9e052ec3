//! Chat and embedding contracts plus the HTTP client for an
//! OpenAI-compatible model host.
//!
//! Everything that talks to a language model goes through [`ChatModel`], so
//! tests swap in scripted models and the rest of the crate never sees HTTP.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

/// Errors from the model host.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request to model host failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model host returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("model returned an empty response")]
    EmptyResponse,
}

/// One chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Overrides the client's default model (used for escalation).
    pub model: Option<String>,
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: &str) -> Self {
        self.system = Some(system.to_string());
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// One chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tokens_used: Option<u32>,
}

/// The chat/embedding contract the core depends on.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError>;

    /// Embed text into the store's vector space.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}

// ── HTTP client ──────────────────────────────────────────────────────

/// Client for an OpenAI-compatible host (`/v1/chat/completions`,
/// `/v1/embeddings`), e.g. a local Ollama or vLLM instance.
pub struct HttpChatModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
    embedding_model: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

impl HttpChatModel {
    pub fn new(base_url: &str, model: &str, embedding_model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            embedding_model: embedding_model.to_string(),
        }
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: Value,
    ) -> Result<T, LlmError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl ChatModel for HttpChatModel {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "messages": messages,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = request.max_tokens {
            body["max_tokens"] = json!(m);
        }

        let parsed: ChatCompletionResponse =
            self.post_json("/v1/chat/completions", body).await?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)?;

        Ok(ChatResponse {
            content,
            tokens_used: parsed.usage.and_then(|u| u.total_tokens),
        })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let body = json!({
            "model": self.embedding_model,
            "input": text,
        });
        let parsed: EmbeddingResponse = self.post_json("/v1/embeddings", body).await?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|row| row.embedding)
            .ok_or(LlmError::EmptyResponse)
    }
}

// ── Response parsing helpers ─────────────────────────────────────────

/// Strip markdown code fences from a model response.
pub fn strip_code_fences(text: &str) -> String {
    text.replace("```json", "").replace("```", "")
}

/// Extract the first balanced JSON object from text, handling nested braces
/// and strings correctly.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut in_string = false;
    let mut escape = false;
    for (i, ch) in text[start..].char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a model response that should contain a JSON value of type `T`.
///
/// Tries a direct parse, then a fence-stripped parse, then the first
/// balanced object in the stripped text.
pub fn parse_json_response<T: for<'de> Deserialize<'de>>(
    text: &str,
) -> Result<T, serde_json::Error> {
    if let Ok(v) = serde_json::from_str::<T>(text) {
        return Ok(v);
    }
    let cleaned = strip_code_fences(text);
    if let Ok(v) = serde_json::from_str::<T>(cleaned.trim()) {
        return Ok(v);
    }
    let extracted = extract_json_object(&cleaned).unwrap_or(cleaned.trim());
    serde_json::from_str(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn parse_direct_json() {
        let parsed: Sample = parse_json_response(r#"{"name": "a", "count": 2}"#).unwrap();
        assert_eq!(parsed.count, 2);
    }

    #[test]
    fn parse_fenced_json() {
        let text = "Here you go:\n```json\n{\"name\": \"a\", \"count\": 3}\n```\nDone.";
        let parsed: Sample = parse_json_response(text).unwrap();
        assert_eq!(parsed.count, 3);
    }

    #[test]
    fn parse_json_with_leading_prose() {
        let text = r#"Sure! {"name": "a", "count": 4} and that's it."#;
        let parsed: Sample = parse_json_response(text).unwrap();
        assert_eq!(parsed.count, 4);
    }

    #[test]
    fn parse_rejects_garbage() {
        let result: Result<Sample, _> = parse_json_response("no json here");
        assert!(result.is_err());
    }

    #[test]
    fn extract_json_object_balanced_braces() {
        let text = r#"prefix {"key": "value with {nested} braces"} suffix"#;
        let extracted = extract_json_object(text).unwrap();
        assert_eq!(extracted, r#"{"key": "value with {nested} braces"}"#);
    }

    #[test]
    fn extract_json_object_escaped_quotes() {
        let text = r#"{"msg": "hello \"world\""}"#;
        assert_eq!(extract_json_object(text).unwrap(), text);
    }

    #[test]
    fn extract_json_object_none_without_json() {
        assert!(extract_json_object("plain text").is_none());
    }

    #[test]
    fn chat_request_builder() {
        let req = ChatRequest::new("hello")
            .with_system("be brief")
            .with_model("large-model")
            .with_temperature(0.2);
        assert_eq!(req.prompt, "hello");
        assert_eq!(req.system.as_deref(), Some("be brief"));
        assert_eq!(req.model.as_deref(), Some("large-model"));
        assert_eq!(req.temperature, Some(0.2));
    }

    #[test]
    fn http_client_normalizes_base_url() {
        let client = HttpChatModel::new("http://localhost:11434/", "m", "e");
        assert_eq!(client.base_url, "http://localhost:11434");
    }
}
