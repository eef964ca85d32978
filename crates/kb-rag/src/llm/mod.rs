//! LLM Module - chat endpoints used for query expansion and answer generation

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::sync::mpsc;

pub mod external;

pub use external::OpenAiCompatibleProvider;

use crate::types::{ConversationMessage, TurnRole};

/// External API providers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApiProvider {
    OpenAI,
    /// Alibaba DashScope compatible mode (Qwen family)
    DashScope,
    /// Volcengine Ark (Doubao family)
    Volcengine,
    /// Google Gemini OpenAI-compatible endpoint
    Gemini,
    OpenRouter,
    Ollama,
    Custom { endpoint: String },
}

impl ApiProvider {
    pub fn chat_endpoint(&self) -> String {
        match self {
            ApiProvider::OpenAI => "https://api.openai.com/v1/chat/completions".to_string(),
            ApiProvider::DashScope => {
                "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions".to_string()
            }
            ApiProvider::Volcengine => {
                "https://ark.cn-beijing.volces.com/api/v3/chat/completions".to_string()
            }
            ApiProvider::Gemini => {
                "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions".to_string()
            }
            ApiProvider::OpenRouter => "https://openrouter.ai/api/v1/chat/completions".to_string(),
            ApiProvider::Ollama => "http://localhost:11434/v1/chat/completions".to_string(),
            ApiProvider::Custom { endpoint } => endpoint.clone(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ApiProvider::OpenAI => "OpenAI",
            ApiProvider::DashScope => "DashScope",
            ApiProvider::Volcengine => "Volcengine",
            ApiProvider::Gemini => "Gemini",
            ApiProvider::OpenRouter => "OpenRouter",
            ApiProvider::Ollama => "Ollama",
            ApiProvider::Custom { .. } => "Custom",
        }
    }
}

/// Core trait for chat endpoints
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Non-streaming chat completion, returning the assistant text.
    async fn chat(&self, messages: &[ChatMessage], config: &GenerationConfig) -> Result<String>;

    /// Streaming chat completion.
    ///
    /// Returns once the endpoint has accepted the request; the receiver then
    /// yields deltas in arrival order and closes after `Done` or `Failed`.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        config: &GenerationConfig,
    ) -> Result<mpsc::Receiver<ChatStreamEvent>>;

    fn info(&self) -> ProviderInfo;
}

/// Generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub max_tokens: usize,
    pub temperature: f32,
    /// Ask for web search if the model family supports it.
    pub web_search: bool,
    /// Request a JSON object response.
    pub json_output: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.7,
            web_search: false,
            json_output: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

impl From<&ConversationMessage> for ChatMessage {
    fn from(turn: &ConversationMessage) -> Self {
        match turn.role {
            TurnRole::User => ChatMessage::user(turn.content.clone()),
            TurnRole::Assistant => ChatMessage::assistant(turn.content.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A streaming event from the chat completion.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatStreamEvent {
    /// A piece of answer text
    ContentDelta(String),
    /// A piece of the model's reasoning trace
    ReasoningDelta(String),
    /// Explicit end marker
    Done,
    /// The stream broke before the end marker
    Failed(String),
}

/// Provider information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub model: String,
    pub supports_web_search: bool,
    pub supports_thinking: bool,
}

// ==================== Model capability profiles ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    /// `gpt-5*` reasoning models
    OpenAiReasoning,
    /// `qwen3-max*`
    Qwen,
    /// `doubao-seed*`
    Doubao,
    /// `gemini*`, searches through Google Search grounding
    Gemini,
    Generic,
}

/// Everything a request builder needs, borrowed from the call site.
pub struct RequestParts<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub config: &'a GenerationConfig,
    pub stream: bool,
}

type RequestBuilder = fn(&ProviderProfile, &RequestParts<'_>) -> JsonValue;

/// Capabilities of a configured model, resolved once at construction.
#[derive(Clone)]
pub struct ProviderProfile {
    pub family: ModelFamily,
    pub supports_web_search: bool,
    pub supports_thinking: bool,
    build_request: RequestBuilder,
}

impl std::fmt::Debug for ProviderProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderProfile")
            .field("family", &self.family)
            .field("supports_web_search", &self.supports_web_search)
            .field("supports_thinking", &self.supports_thinking)
            .finish()
    }
}

impl ProviderProfile {
    pub fn resolve(model: &str) -> Self {
        let lower = model.to_ascii_lowercase();
        if lower.starts_with("gpt-5") {
            Self {
                family: ModelFamily::OpenAiReasoning,
                supports_web_search: true,
                supports_thinking: true,
                build_request: build_openai_reasoning,
            }
        } else if lower.starts_with("qwen3-max") {
            // Dated snapshots expose the thinking switch; the rolling alias does not.
            let supports_thinking = lower.len() > "qwen3-max".len();
            Self {
                family: ModelFamily::Qwen,
                supports_web_search: true,
                supports_thinking,
                build_request: build_qwen,
            }
        } else if lower.starts_with("doubao-seed") {
            Self {
                family: ModelFamily::Doubao,
                supports_web_search: true,
                supports_thinking: true,
                build_request: build_doubao,
            }
        } else if lower.starts_with("gemini") {
            Self {
                family: ModelFamily::Gemini,
                supports_web_search: true,
                supports_thinking: false,
                build_request: build_gemini,
            }
        } else {
            Self {
                family: ModelFamily::Generic,
                supports_web_search: false,
                supports_thinking: false,
                build_request: build_generic,
            }
        }
    }

    pub fn build_request(&self, parts: &RequestParts<'_>) -> JsonValue {
        (self.build_request)(self, parts)
    }

    fn wants_web_search(&self, parts: &RequestParts<'_>) -> bool {
        self.supports_web_search && parts.config.web_search
    }
}

fn base_request(parts: &RequestParts<'_>) -> JsonValue {
    let mut request = json!({
        "model": parts.model,
        "messages": parts.messages,
        "max_tokens": parts.config.max_tokens,
        "temperature": parts.config.temperature,
        "stream": parts.stream,
    });
    if parts.config.json_output {
        request["response_format"] = json!({"type": "json_object"});
    }
    request
}

fn build_generic(_profile: &ProviderProfile, parts: &RequestParts<'_>) -> JsonValue {
    base_request(parts)
}

fn build_openai_reasoning(profile: &ProviderProfile, parts: &RequestParts<'_>) -> JsonValue {
    let mut request = base_request(parts);
    // Reasoning models reject sampling overrides and use a completion budget.
    if let Some(obj) = request.as_object_mut() {
        obj.remove("temperature");
        obj.remove("max_tokens");
        obj.insert("max_completion_tokens".into(), json!(parts.config.max_tokens));
    }
    request["reasoning_effort"] = json!("medium");
    if profile.wants_web_search(parts) {
        request["tools"] = json!([{"type": "web_search_preview"}]);
    }
    request
}

fn build_qwen(profile: &ProviderProfile, parts: &RequestParts<'_>) -> JsonValue {
    let mut request = base_request(parts);
    if profile.wants_web_search(parts) {
        request["enable_search"] = json!(true);
    }
    if profile.supports_thinking && parts.stream {
        request["enable_thinking"] = json!(true);
    }
    request
}

fn build_doubao(profile: &ProviderProfile, parts: &RequestParts<'_>) -> JsonValue {
    let mut request = base_request(parts);
    if profile.wants_web_search(parts) {
        request["tools"] = json!([{"type": "web_search"}]);
    }
    request
}

fn build_gemini(profile: &ProviderProfile, parts: &RequestParts<'_>) -> JsonValue {
    let mut request = base_request(parts);
    if profile.wants_web_search(parts) {
        request["tools"] = json!([{"google_search": {}}]);
    }
    request
}
