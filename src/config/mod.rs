//! Bridge configuration structures
//!
//! Configuration is owned by the host (persistence and UI live outside this crate); the
//! core only reads it. Files may be YAML or JSON.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::{Error, ErrorContext, Result};

/// Backend family of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    #[serde(alias = "openai", alias = "openai_chat", alias = "openai-compatible")]
    OpenAiCompatible,
    #[serde(alias = "openai-responses", alias = "responses")]
    OpenAiResponses,
    #[serde(alias = "anthropic_messages", alias = "claude")]
    Anthropic,
    #[serde(alias = "gemini_ai_studio", alias = "google", alias = "gemini-ai-studio")]
    Gemini,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::OpenAiCompatible => "openai_compatible",
            ProviderType::OpenAiResponses => "openai_responses",
            ProviderType::Anthropic => "anthropic",
            ProviderType::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-provided backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(rename = "type", default)]
    pub provider_type: Option<ProviderType>,
    #[serde(default, alias = "baseUrl")]
    pub base_url: String,
    /// Bearer token / API key. Sent with the header convention of the backend family.
    #[serde(default, alias = "apiKey", skip_serializing)]
    pub api_key: Option<String>,
    /// Custom headers; they override the family's auth header when both are present.
    #[serde(default, skip_serializing)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, alias = "defaultModel")]
    pub default_model: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    /// Per-request default fields merged into every request body (e.g. `reasoning_effort`).
    #[serde(default, alias = "requestDefaults")]
    pub request_defaults: serde_json::Map<String, serde_json::Value>,
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>, provider_type: ProviderType, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider_type: Some(provider_type),
            base_url: base_url.into(),
            api_key: None,
            headers: BTreeMap::new(),
            default_model: None,
            models: Vec::new(),
            request_defaults: serde_json::Map::new(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn credential(&self) -> Credential {
        Credential {
            api_key: self
                .api_key
                .as_ref()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty()),
            headers: self.headers.clone(),
        }
    }

    /// Static model resolution: default model, else first declared model.
    pub fn static_model(&self) -> Option<String> {
        self.default_model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(String::from)
            .or_else(|| {
                self.models
                    .iter()
                    .map(|m| m.trim())
                    .find(|m| !m.is_empty())
                    .map(String::from)
            })
    }

    /// Check the fields every probe depends on. The error names the first missing field.
    pub fn check(&self) -> Result<ProviderType> {
        let ctx = |field: &str| {
            ErrorContext::new()
                .with_field_path(format!("providers.{}.{}", self.id, field))
                .with_source("config")
        };
        let provider_type = self.provider_type.ok_or_else(|| {
            Error::configuration_with_context("provider type is missing", ctx("type"))
        })?;
        let base = self.base_url.trim();
        if base.is_empty() {
            return Err(Error::configuration_with_context(
                "base_url is missing",
                ctx("base_url"),
            ));
        }
        if url::Url::parse(base).is_err() {
            return Err(Error::configuration_with_context(
                "base_url is not a valid URL",
                ctx("base_url").with_details(base.to_string()),
            ));
        }
        if self.credential().is_empty() {
            return Err(Error::configuration_with_context(
                "credential is missing (api_key or headers)",
                ctx("api_key"),
            ));
        }
        Ok(provider_type)
    }
}

/// Credential of a provider: bearer token and/or custom header map.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub api_key: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl Credential {
    pub fn bearer(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
            headers: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.api_key.is_none() && self.headers.values().all(|v| v.trim().is_empty())
    }

    /// Every secret value, used to scrub diagnostics.
    pub fn secrets(&self) -> Vec<String> {
        let mut out: Vec<String> = self.api_key.iter().cloned().collect();
        out.extend(
            self.headers
                .values()
                .map(|v| v.trim().trim_start_matches("Bearer ").to_string())
                .filter(|v| v.len() >= 4),
        );
        out
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Routing mode of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMode {
    Official,
    Byok,
    Disabled,
}

/// Per-endpoint routing rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteRule {
    pub mode: RuleMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl RouteRule {
    pub fn byok(provider_id: impl Into<String>) -> Self {
        Self {
            mode: RuleMode::Byok,
            provider_id: Some(provider_id.into()),
            model: None,
        }
    }

    pub fn disabled() -> Self {
        Self {
            mode: RuleMode::Disabled,
            provider_id: None,
            model: None,
        }
    }
}

impl<'de> Deserialize<'de> for RouteRule {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Input {
            // Shorthand: "/record-session-events": disabled
            Mode(RuleMode),
            Obj {
                mode: RuleMode,
                #[serde(default, alias = "providerId", alias = "provider")]
                provider_id: Option<String>,
                #[serde(default)]
                model: Option<String>,
            },
        }

        match Input::deserialize(deserializer)? {
            Input::Mode(mode) => Ok(RouteRule {
                mode,
                provider_id: None,
                model: None,
            }),
            Input::Obj {
                mode,
                provider_id,
                model,
            } => Ok(RouteRule {
                mode,
                provider_id,
                model,
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Rules keyed by endpoint (e.g. "/chat-stream"); the leading slash is optional.
    #[serde(default)]
    pub rules: HashMap<String, RouteRule>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Master switch; the runtime flag passed to the router usually mirrors it.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
}

impl BridgeConfig {
    /// Parse YAML (JSON is accepted as a YAML subset).
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| {
            Error::configuration_with_context(
                format!("failed to parse configuration: {}", e),
                ErrorContext::new().with_source("config"),
            )
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&content)?;
        tracing::debug!(
            path = %path.display(),
            providers = config.providers.len(),
            rules = config.routing.rules.len(),
            "Loaded bridge configuration"
        );
        Ok(config)
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Rule for an endpoint, tolerant of a missing/extra leading slash.
    pub fn rule_for(&self, endpoint: &str) -> Option<&RouteRule> {
        let wanted = normalize_endpoint(endpoint);
        self.routing
            .rules
            .iter()
            .find(|(k, _)| normalize_endpoint(k) == wanted)
            .map(|(_, v)| v)
    }

    /// Structural validation: unique provider ids and rules that reference known providers.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for (i, p) in self.providers.iter().enumerate() {
            if p.id.trim().is_empty() {
                return Err(Error::configuration_with_context(
                    "provider id is empty",
                    ErrorContext::new().with_field_path(format!("providers[{}].id", i)),
                ));
            }
            if !seen.insert(p.id.as_str()) {
                return Err(Error::configuration_with_context(
                    format!("duplicate provider id '{}'", p.id),
                    ErrorContext::new().with_field_path(format!("providers[{}].id", i)),
                ));
            }
        }
        for (endpoint, rule) in &self.routing.rules {
            if let Some(id) = &rule.provider_id {
                if self.provider(id).is_none() {
                    tracing::warn!(
                        endpoint = %endpoint,
                        provider_id = %id,
                        "Routing rule references an unknown provider; the first provider will be used"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Canonical endpoint form: single leading slash, no trailing slash.
pub fn normalize_endpoint(endpoint: &str) -> String {
    format!("/{}", endpoint.trim().trim_matches('/'))
}
