//! OpenRouter chat-completions client.
//!
//! Implements [`ModelEndpoint`] over the OpenAI-compatible
//! `/chat/completions` API. Prompt caching on this endpoint is implicit
//! (provider-side), so requests carrying an explicit `cache_ref` are
//! rejected; run the coordinator with caching disabled or with a backend
//! that owns the endpoint.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::endpoint::{ModelEndpoint, ModelFuture, ModelRequest, ModelResponse, StopSignal, Usage};
use crate::error::ModelError;
use crate::{Message, ToolCall, ToolDef};

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Default model for all LLM calls.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

// ── Wire types ─────────────────────────────────────────────────────

/// Chat completion request body.
#[derive(Serialize, Debug, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "is_zero_f32")]
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageOptions>,
}

/// Ask the API to include token accounting (with cached-token details).
#[derive(Serialize, Debug, Clone, Copy)]
pub struct UsageOptions {
    pub include: bool,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}
fn is_zero_f32(v: &f32) -> bool {
    *v == 0.0
}

impl ChatRequest {
    /// Build the wire body for one model request.
    pub fn from_model_request(request: &ModelRequest) -> Self {
        Self {
            model: request.model.clone(),
            messages: request.messages(),
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
            tools: (!request.tools.is_empty()).then(|| request.tools.clone()),
            usage: Some(UsageOptions { include: true }),
        }
    }
}

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
    #[serde(default)]
    code: Option<u16>,
}

/// Token usage statistics as reported by the API.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    #[serde(default)]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct PromptTokensDetails {
    pub cached_tokens: Option<u32>,
}

impl UsageInfo {
    /// Split prompt tokens into fresh and cached.
    pub fn to_usage(&self) -> Usage {
        let prompt = self.prompt_tokens.unwrap_or(0);
        let cached = self
            .prompt_tokens_details
            .as_ref()
            .and_then(|d| d.cached_tokens)
            .unwrap_or(0)
            .min(prompt);
        Usage {
            fresh_input_tokens: prompt - cached,
            cached_input_tokens: cached,
            output_tokens: self.completion_tokens.unwrap_or(0),
        }
    }
}

/// Map the API's finish reason onto a [`StopSignal`].
///
/// Returned tool calls win over whatever the finish reason says.
fn stop_signal(finish_reason: Option<&str>, has_tool_calls: bool) -> StopSignal {
    if has_tool_calls {
        return StopSignal::ToolRequested;
    }
    match finish_reason {
        Some("length") => StopSignal::LengthLimited,
        Some("tool_calls") => StopSignal::ToolRequested,
        _ => StopSignal::Completed,
    }
}

fn parse_response(text: &str) -> Result<ModelResponse, ModelError> {
    let parsed: RawChatResponse = serde_json::from_str(text)
        .map_err(|e| ModelError::Other(format!("failed to parse response: {e}")))?;

    if let Some(err) = parsed.error {
        return Err(match err.code {
            Some(status) => ModelError::from_status(status, &err.message),
            None => ModelError::Other(format!("OpenRouter API error: {}", err.message)),
        });
    }

    let usage = parsed.usage.as_ref().map(UsageInfo::to_usage).unwrap_or_default();
    if let Some(ref info) = parsed.usage {
        debug!(
            "Token usage: prompt={}, cached={}, completion={}, total={}",
            info.prompt_tokens.unwrap_or(0),
            usage.cached_input_tokens,
            info.completion_tokens.unwrap_or(0),
            info.total_tokens.unwrap_or(0),
        );
    }

    let choice = parsed
        .choices
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| ModelError::Other("response contained no choices".into()))?;

    let tool_calls = choice.message.tool_calls.unwrap_or_default();
    let stop = stop_signal(choice.finish_reason.as_deref(), !tool_calls.is_empty());
    debug!(
        "LLM output: {} chars text, {} tool call(s), stop={:?}",
        choice.message.content.as_ref().map_or(0, |s| s.len()),
        tool_calls.len(),
        stop,
    );

    Ok(ModelResponse {
        text: choice.message.content.filter(|s| !s.is_empty()),
        tool_calls,
        stop,
        usage,
    })
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for the OpenRouter chat completions API.
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    referer: String,
    title: String,
    url: String,
}

impl std::fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterClient")
            .field("url", &self.url)
            .field("referer", &self.referer)
            .field("title", &self.title)
            .finish_non_exhaustive()
    }
}

impl OpenRouterClient {
    /// Create a new client with the given API key and default headers.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ModelError> {
        Self::with_headers(api_key, "https://github.com/tether-rs", "tether-rs")
    }

    /// Create a new client with custom Referer and X-Title headers.
    pub fn with_headers(
        api_key: impl Into<String>,
        referer: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .user_agent("tether-rs/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ModelError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            referer: referer.into(),
            title: title.into(),
            url: OPENROUTER_URL.to_string(),
        })
    }

    /// Point the client at a different OpenAI-compatible endpoint.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Send a chat completion request.
    pub async fn chat(&self, body: &ChatRequest) -> Result<ModelResponse, ModelError> {
        debug!(
            "LLM request: model={}, messages={}, tools={}, max_tokens={}, temp={}",
            body.model,
            body.messages.len(),
            body.tools.as_ref().map_or(0, |t| t.len()),
            body.max_tokens,
            body.temperature,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let start = Instant::now();

        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(body)
            .send()
            .await
            .map_err(|e| ModelError::Transient(format!("request failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ModelError::Transient(format!("failed to read response: {e}")))?;

        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(ModelError::from_status(status.as_u16(), &text));
        }

        parse_response(&text)
    }
}

impl ModelEndpoint for OpenRouterClient {
    fn complete<'a>(&'a self, request: &'a ModelRequest) -> ModelFuture<'a> {
        Box::pin(async move {
            if let Some(ref cache) = request.cache_ref {
                return Err(ModelError::InvalidRequest(format!(
                    "explicit cache '{cache}' is not supported by this endpoint"
                )));
            }
            self.chat(&ChatRequest::from_model_request(request)).await
        })
    }
}
