//! Generation provider capability.
//!
//! Every stage (summarizer, planner, responder) talks to a model through
//! [`GenerationProvider`]. Concrete backends are interchangeable adapters:
//! an OpenAI-compatible chat-completions client (OpenAI, Ollama, LM Studio,
//! vLLM, ...) and the Anthropic messages API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{AgentConfig, ProviderKind};
use crate::error::{ConfigurationError, ProviderError};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// One generation call: prompt plus constraints.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: Option<String>,
    pub messages: Vec<Message>,
    /// Overrides the provider's default model when set.
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl GenerationRequest {
    pub fn new(messages: Vec<Message>, max_tokens: u32) -> Self {
        Self {
            system: None,
            messages,
            model: None,
            max_tokens,
            temperature: 0.7,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model.filter(|m| !m.trim().is_empty());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError>;
}

/// Runs `generate` with a hard deadline, independent of the adapter's own
/// HTTP timeout.
pub async fn generate_within(
    provider: &dyn GenerationProvider,
    request: &GenerationRequest,
    limit: Duration,
) -> Result<String, ProviderError> {
    match tokio::time::timeout(limit, provider.generate(request)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(limit)),
    }
}

/// Builds the configured provider. Fails only on missing credentials.
pub fn build_provider(config: &AgentConfig) -> Result<Box<dyn GenerationProvider>, ConfigurationError> {
    let timeout = Duration::from_secs(config.generation_timeout_secs.max(1));
    let api_key = config.resolved_api_key();

    match config.provider {
        ProviderKind::Anthropic => {
            let api_key = api_key.ok_or(ConfigurationError::MissingCredentials {
                provider: "anthropic",
                env_var: "ANTHROPIC_API_KEY",
            })?;
            Ok(Box::new(AnthropicProvider::new(
                config.resolved_api_url(),
                api_key,
                config.resolved_response_model(),
                timeout,
            )))
        }
        ProviderKind::OpenAi => {
            let api_url = config.resolved_api_url();
            if api_key.is_none() && api_url.contains("api.openai.com") {
                return Err(ConfigurationError::MissingCredentials {
                    provider: "openai",
                    env_var: "OPENAI_API_KEY",
                });
            }
            Ok(Box::new(OpenAiCompatibleProvider::new(
                api_url,
                api_key.unwrap_or_default(),
                config.resolved_response_model(),
                timeout,
            )))
        }
    }
}

fn http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("Failed to build HTTP client with timeout ({}), using defaults", e);
            Client::new()
        })
}

fn map_send_error(e: reqwest::Error, timeout: Duration) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(timeout)
    } else {
        ProviderError::Http(e)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read body".to_string());
    // 529 is Anthropic's "overloaded".
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 529 {
        return Err(ProviderError::RateLimited(body));
    }
    Err(ProviderError::Api {
        status: status.as_u16(),
        message: body,
    })
}

// ─── OpenAI-compatible ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

pub struct OpenAiCompatibleProvider {
    api_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    client: Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(api_url: String, api_key: String, model: String, timeout: Duration) -> Self {
        Self {
            api_url: normalize_openai_url(&api_url),
            api_key,
            model,
            timeout,
            client: http_client(timeout),
        }
    }
}

/// Accepts `http://host:port`, `.../v1` or `.../v1/` and returns the `/v1` base.
fn normalize_openai_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed)
    }
}

#[async_trait]
impl GenerationProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.api_url);

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(Message {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.extend(request.messages.iter().cloned());

        let body = ChatCompletionRequest {
            model: request.model.as_deref().unwrap_or(&self.model),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut req = self.client.post(&url).json(&body);
        // Local servers run without a key.
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout))?;
        let response = check_status(response).await?;

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| ProviderError::InvalidResponse("no choices returned".to_string()))
    }
}

// ─── Anthropic ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: &'a [Message],
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

pub struct AnthropicProvider {
    api_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(api_url: String, api_key: String, model: String, timeout: Duration) -> Self {
        Self {
            api_url: api_url.trim().trim_end_matches('/').to_string(),
            api_key,
            model,
            timeout,
            client: http_client(timeout),
        }
    }
}

#[async_trait]
impl GenerationProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let url = format!("{}/v1/messages", self.api_url);
        let body = AnthropicRequest {
            model: request.model.as_deref().unwrap_or(&self.model),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: request.system.as_deref(),
            messages: &request.messages,
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout))?;
        let response = check_status(response).await?;

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let text: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        if parsed.content.is_empty() {
            return Err(ProviderError::InvalidResponse("empty content".to_string()));
        }
        Ok(text.trim().to_string())
    }
}

// ─── Structured output helpers ───────────────────────────────────────────────

/// Pulls the first JSON object out of a model reply.
///
/// Handles `<think>` blocks, markdown code fences, surrounding prose, trailing
/// commas and smart quotes.
pub fn extract_json_object(response: &str) -> Option<serde_json::Value> {
    let text = strip_thinking_tags(response.trim());

    let candidates = [
        extract_from_code_block(&text),
        extract_balanced_object(&text),
        Some(text.clone()),
    ];

    for candidate in candidates.into_iter().flatten() {
        if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str::<serde_json::Value>(&candidate) {
            return Some(value);
        }
        let cleaned = clean_json_string(&candidate);
        if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str::<serde_json::Value>(&cleaned) {
            tracing::debug!("Extracted JSON after cleaning");
            return Some(value);
        }
    }

    tracing::debug!("No JSON object found in model reply");
    None
}

fn strip_thinking_tags(text: &str) -> String {
    let mut result = text.to_string();
    for (open_tag, close_tag) in [("<thinking>", "</thinking>"), ("<think>", "</think>")] {
        while let Some(start) = result.find(open_tag) {
            match result[start..].find(close_tag) {
                Some(end) => result.replace_range(start..start + end + close_tag.len(), ""),
                None => result.replace_range(start..start + open_tag.len(), ""),
            }
        }
    }
    result.trim().to_string()
}

fn extract_from_code_block(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let after = after.strip_prefix("json").unwrap_or(after);
    let end = after.find("```")?;
    Some(after[..end].trim().to_string())
}

/// Outermost `{...}` span, ignoring braces inside string literals.
fn extract_balanced_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(text[start..=start + offset].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn clean_json_string(text: &str) -> String {
    let mut cleaned = text
        .replace('\u{201C}', "\"")
        .replace('\u{201D}', "\"");
    for (from, to) in [(",}", "}"), (",]", "]"), (", }", " }"), (", ]", " ]")] {
        cleaned = cleaned.replace(from, to);
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_from_markdown_fence() {
        let input = "Sure!\n```json\n{\"intent\": \"reflect\", \"tone\": \"caring\"}\n```\nDone.";
        let value = extract_json_object(input).unwrap();
        assert_eq!(value["intent"], "reflect");
    }

    #[test]
    fn extracts_json_surrounded_by_prose_and_thinking() {
        let input = "<think>hmm {not json}</think>Plan: {\"hint\": \"use {braces}\", \"tone\": \"playful\"} ok";
        let value = extract_json_object(input).unwrap();
        assert_eq!(value["tone"], "playful");
        assert_eq!(value["hint"], "use {braces}");
    }

    #[test]
    fn repairs_trailing_commas_and_smart_quotes() {
        let input = "{\u{201C}digest\u{201D}: \"ok\", \"unanswered_questions\": [\"a\",],}";
        let value = extract_json_object(input).unwrap();
        assert_eq!(value["digest"], "ok");
        assert_eq!(value["unanswered_questions"][0], "a");
    }

    #[test]
    fn returns_none_without_an_object() {
        assert!(extract_json_object("just some words").is_none());
        assert!(extract_json_object("[1, 2, 3]").is_none());
    }

    #[test]
    fn normalizes_openai_base_url() {
        assert_eq!(normalize_openai_url("http://localhost:11434"), "http://localhost:11434/v1");
        assert_eq!(normalize_openai_url("http://localhost:11434/v1/"), "http://localhost:11434/v1");
    }

    struct SlowProvider;

    #[async_trait]
    impl GenerationProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<String, ProviderError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("too late".to_string())
        }
    }

    #[tokio::test]
    async fn generate_within_enforces_deadline() {
        let request = GenerationRequest::new(vec![Message::user("hi")], 10);
        let err = generate_within(&SlowProvider, &request, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
        assert_eq!(err.category(), "timeout");
    }
}
