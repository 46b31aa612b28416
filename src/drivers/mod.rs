//! 后端驱动抽象层：四类后端协议的请求构建、流式帧解析与模型列表
//!
//! Backend driver abstraction. Each backend family (OpenAI chat-completions, OpenAI
//! responses, Anthropic messages, Gemini generateContent) has one [`BackendDriver`]
//! implementation that only translates: it builds [`DriverRequest`]s and maps native
//! frames to [`StreamingEvent`]s. I/O, deadlines and aggregation live in
//! [`BackendAdapter`].

pub mod adapter;
pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod openai_responses;

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::config::{Credential, ProviderConfig, ProviderType};
use crate::pipeline::SseFrame;
use crate::types::{CanonicalChatRequest, Message, StreamingEvent};
use crate::Result;

pub use adapter::{BackendAdapter, ModelDiscovery};
pub use anthropic::AnthropicDriver;
pub use gemini::GeminiDriver;
pub use openai::OpenAiDriver;
pub use openai_responses::OpenAiResponsesDriver;

/// Default per-call deadline of adapter operations.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(120_000);

/// Default deadline of model discovery; narrower than a full call.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Unified HTTP request representation for backend communication.
#[derive(Debug, Clone)]
pub struct DriverRequest {
    /// Full target URL (may carry an API-key query parameter; redact before logging).
    pub url: String,
    /// HTTP method (POST for chat, GET for models).
    pub method: String,
    /// Request headers, in insertion order.
    pub headers: Vec<(String, String)>,
    /// JSON request body.
    pub body: Option<Value>,
    /// Whether streaming is requested.
    pub stream: bool,
}

impl DriverRequest {
    pub fn post(url: impl Into<String>, body: Value, stream: bool) -> Self {
        Self {
            url: url.into(),
            method: "POST".into(),
            headers: Vec::new(),
            body: Some(body),
            stream,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".into(),
            headers: Vec::new(),
            body: None,
            stream: false,
        }
    }

    /// Set a header, replacing any existing value with the same (case-insensitive) name.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Append a query parameter to the URL.
    pub fn add_query(&mut self, key: &str, value: &str) {
        if let Ok(mut url) = url::Url::parse(&self.url) {
            url.query_pairs_mut().append_pair(key, value);
            self.url = url.to_string();
        }
    }

    /// Custom credential headers override the family's auth header.
    pub fn apply_custom_headers(&mut self, credential: &Credential) {
        for (k, v) in &credential.headers {
            if !v.trim().is_empty() {
                self.set_header(k.clone(), v.clone());
            }
        }
    }
}

/// Where and how to reach a backend.
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub base_url: String,
    pub credential: Credential,
}

impl ProviderEndpoint {
    pub fn new(base_url: impl Into<String>, credential: Credential) -> Self {
        Self {
            base_url: base_url.into(),
            credential,
        }
    }

    pub fn from_provider(provider: &ProviderConfig) -> Self {
        Self::new(provider.base_url.trim(), provider.credential())
    }

    pub fn secrets(&self) -> Vec<String> {
        self.credential.secrets()
    }

    /// Trimmed API key, if one is configured.
    pub fn api_key(&self) -> Option<&str> {
        self.credential
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

/// One-shot or text-streaming call.
#[derive(Debug, Clone)]
pub struct TextCall {
    pub endpoint: ProviderEndpoint,
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    /// Extra body fields (provider `request_defaults`).
    pub defaults: Map<String, Value>,
    pub max_tokens: Option<u32>,
}

impl TextCall {
    pub fn new(endpoint: ProviderEndpoint, model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            endpoint,
            model: model.into(),
            system_prompt: String::new(),
            messages,
            timeout: DEFAULT_CALL_TIMEOUT,
            cancel: CancellationToken::new(),
            defaults: Map::new(),
            max_tokens: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_defaults(mut self, defaults: Map<String, Value>) -> Self {
        self.defaults = defaults;
        self
    }
}

/// Agentic chat call carrying the canonical request.
#[derive(Debug, Clone)]
pub struct ChatCall {
    pub endpoint: ProviderEndpoint,
    pub model: String,
    pub system_prompt: String,
    pub request: CanonicalChatRequest,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    pub defaults: Map<String, Value>,
    pub max_tokens: Option<u32>,
}

impl ChatCall {
    pub fn new(endpoint: ProviderEndpoint, model: impl Into<String>, request: CanonicalChatRequest) -> Self {
        Self {
            endpoint,
            model: model.into(),
            system_prompt: String::new(),
            request,
            timeout: DEFAULT_CALL_TIMEOUT,
            cancel: CancellationToken::new(),
            defaults: Map::new(),
            max_tokens: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_defaults(mut self, defaults: Map<String, Value>) -> Self {
        self.defaults = defaults;
        self
    }
}

/// Per-stream scratch state owned by the adapter and lent to the driver for each frame.
#[derive(Debug, Default)]
pub struct FrameContext {
    /// Content-block / output index → tool call id, for blocks that are tool calls.
    pub tool_indices: HashMap<u32, String>,
    /// Backend item id → tool call id.
    pub item_calls: HashMap<String, String>,
    /// Counter for synthesized ids.
    pub seq: u32,
}

impl FrameContext {
    pub fn next_id(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{}_{}_{}", prefix, self.seq, uuid::Uuid::new_v4().simple())
    }
}

/// Core trait for backend-specific wire translation.
///
/// The trait is object-safe; the adapter holds it as `Arc<dyn BackendDriver>` so that
/// returned streams can own it.
pub trait BackendDriver: Send + Sync + std::fmt::Debug {
    fn provider_type(&self) -> ProviderType;

    /// Text-only request (`complete_text` / `stream_text_deltas`).
    fn build_text_request(&self, call: &TextCall, stream: bool) -> Result<DriverRequest>;

    /// Streaming agentic chat request with tools.
    fn build_chat_request(&self, call: &ChatCall) -> Result<DriverRequest>;

    /// Extract the text of a non-streaming response.
    fn parse_text_response(&self, body: &Value) -> Result<String>;

    /// Map one SSE frame to zero or more intermediate events.
    fn parse_stream_event(&self, frame: &SseFrame, ctx: &mut FrameContext) -> Result<Vec<StreamingEvent>>;

    /// Model-list URLs to try in order: unprefixed first, then the versioned variant.
    fn model_list_urls(&self, endpoint: &ProviderEndpoint) -> Vec<String>;

    /// Authenticated GET for one of [`Self::model_list_urls`].
    fn model_list_request(&self, endpoint: &ProviderEndpoint, url: &str) -> DriverRequest;

    fn parse_model_list(&self, body: &Value) -> Vec<String>;
}

/// Factory function to create the driver of a backend family.
pub fn create_driver(provider_type: ProviderType) -> Box<dyn BackendDriver> {
    match provider_type {
        ProviderType::OpenAiCompatible => Box::new(OpenAiDriver),
        ProviderType::OpenAiResponses => Box::new(OpenAiResponsesDriver),
        ProviderType::Anthropic => Box::new(AnthropicDriver),
        ProviderType::Gemini => Box::new(GeminiDriver),
    }
}

/// `base` + `/` + `path` with exactly one slash between them.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim().trim_end_matches('/'), path.trim_start_matches('/'))
}

/// `base` with a trailing version segment, unless it already ends with one.
pub(crate) fn versioned_base(base: &str, version: &str) -> String {
    let trimmed = base.trim().trim_end_matches('/');
    let last = trimmed.rsplit('/').next().unwrap_or("");
    let already_versioned =
        last.starts_with('v') && last.chars().nth(1).map_or(false, |c| c.is_ascii_digit());
    if already_versioned {
        trimmed.to_string()
    } else {
        format!("{}/{}", trimmed, version)
    }
}

/// Primary and versioned model-list URLs, de-duplicated.
pub(crate) fn model_urls(base: &str, version: &str) -> Vec<String> {
    let primary = join_url(base, "models");
    let fallback = join_url(&versioned_base(base, version), "models");
    if primary == fallback {
        vec![primary]
    } else {
        vec![primary, fallback]
    }
}

/// Body fields owned by the drivers; request defaults never override them.
const PROTECTED_KEYS: &[&str] = &[
    "model",
    "messages",
    "input",
    "contents",
    "stream",
    "tools",
    "instructions",
    "system",
    "systemInstruction",
];

pub(crate) fn merge_defaults(body: &mut Value, defaults: &Map<String, Value>) {
    if let Value::Object(map) = body {
        for (k, v) in defaults {
            if PROTECTED_KEYS.contains(&k.as_str()) {
                continue;
            }
            map.insert(k.clone(), v.clone());
        }
    }
}

/// `{"data":[{"id"}]}` or `{"models":[{"id"|"name"}]}` or a bare array.
pub(crate) fn ids_from_model_list(body: &Value) -> Vec<String> {
    let items = body
        .get("data")
        .or_else(|| body.get("models"))
        .and_then(Value::as_array)
        .or_else(|| body.as_array());
    items
        .map(|items| {
            items
                .iter()
                .filter_map(|m| match m {
                    Value::String(s) => Some(s.clone()),
                    other => other
                        .get("id")
                        .or_else(|| other.get("name"))
                        .and_then(Value::as_str)
                        .map(String::from),
                })
                .filter(|s| !s.trim().is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versioned_base() {
        assert_eq!(versioned_base("https://x/v1", "v1"), "https://x/v1");
        assert_eq!(versioned_base("https://x/", "v1"), "https://x/v1");
        assert_eq!(versioned_base("https://g/v1beta", "v1beta"), "https://g/v1beta");
        assert_eq!(versioned_base("https://x/api/vendor", "v1"), "https://x/api/vendor/v1");
        assert_eq!(versioned_base("https://gw.example/vé", "v1"), "https://gw.example/vé/v1");
        assert_eq!(versioned_base("https://gw.example/v", "v1"), "https://gw.example/v/v1");
    }

    #[test]
    fn test_model_urls_fallback_only_when_distinct() {
        assert_eq!(model_urls("https://x/v1", "v1"), vec!["https://x/v1/models"]);
        assert_eq!(
            model_urls("https://x", "v1"),
            vec!["https://x/models", "https://x/v1/models"]
        );
    }

    #[test]
    fn test_custom_headers_override() {
        let mut req = DriverRequest::get("https://x/models");
        req.set_header("Authorization", "Bearer a");
        let mut cred = Credential::default();
        cred.headers.insert("authorization".into(), "Token b".into());
        req.apply_custom_headers(&cred);
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.header("Authorization"), Some("Token b"));
    }

    #[test]
    fn test_merge_defaults_protects_driver_fields() {
        let mut body = serde_json::json!({"model": "m", "stream": true});
        let mut defaults = Map::new();
        defaults.insert("model".into(), Value::String("other".into()));
        defaults.insert("temperature".into(), serde_json::json!(0.2));
        merge_defaults(&mut body, &defaults);
        assert_eq!(body["model"], "m");
        assert_eq!(body["temperature"], 0.2);
    }

    #[test]
    fn test_ids_from_model_list_shapes() {
        assert_eq!(
            ids_from_model_list(&serde_json::json!({"data": [{"id": "m1"}, {"id": ""}]})),
            vec!["m1"]
        );
        assert_eq!(
            ids_from_model_list(&serde_json::json!({"models": [{"name": "a"}]})),
            vec!["a"]
        );
    }
}
