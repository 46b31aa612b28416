//! Per-endpoint routing decision.
//!
//! This module is **pure logic**: it performs no network calls. When a `byok` route
//! needs a model that only discovery can provide, [`decide_route`] fails with an
//! unresolved-model configuration error and the caller (see
//! [`crate::client::Bridge::route`]) retries with [`decide_route_with_models`] after
//! listing the provider's models.

use serde::Serialize;
use serde_json::Value;

use crate::config::{normalize_endpoint, BridgeConfig, ProviderConfig, RuleMode};
use crate::error::UNRESOLVED_MODEL_FIELD;
use crate::{Error, ErrorContext, Result};

/// Where a request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMode {
    /// Pass-through to the official service; the core is not involved further.
    Official,
    /// Served by a user-provided backend.
    Byok,
    /// Answered locally with a stub; no backend call.
    Disabled,
}

impl RouteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteMode::Official => "official",
            RouteMode::Byok => "byok",
            RouteMode::Disabled => "disabled",
        }
    }
}

/// Routing decision for one request. `provider` and `model` are set iff `mode` is
/// [`RouteMode::Byok`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub endpoint: String,
    pub mode: RouteMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_model: Option<String>,
    pub reason: String,
}

impl Route {
    fn new(endpoint: String, mode: RouteMode, requested_model: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            endpoint,
            mode,
            provider: None,
            model: None,
            requested_model,
            reason: reason.into(),
        }
    }

    pub fn is_byok(&self) -> bool {
        self.mode == RouteMode::Byok
    }

    pub fn provider_id(&self) -> Option<&str> {
        self.provider.as_ref().map(|p| p.id.as_str())
    }
}

/// Decide the route of `endpoint`. Equivalent to [`decide_route_with_models`] with no
/// discovered models.
pub fn decide_route(config: &BridgeConfig, endpoint: &str, body: &Value, runtime_enabled: bool) -> Result<Route> {
    decide_route_with_models(config, endpoint, body, runtime_enabled, &[])
}

/// Decide the route of `endpoint`, using `discovered` as the last link of the model
/// chain: rule model → provider default → first declared → first discovered.
pub fn decide_route_with_models(
    config: &BridgeConfig,
    endpoint: &str,
    body: &Value,
    runtime_enabled: bool,
    discovered: &[String],
) -> Result<Route> {
    let endpoint = normalize_endpoint(endpoint);
    let requested_model = body
        .get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(String::from);

    if !runtime_enabled {
        return Ok(Route::new(endpoint, RouteMode::Official, requested_model, "runtime disabled"));
    }

    let Some(rule) = config.rule_for(&endpoint) else {
        return Ok(Route::new(endpoint, RouteMode::Official, requested_model, "no rule"));
    };

    match rule.mode {
        RuleMode::Official => Ok(Route::new(endpoint, RouteMode::Official, requested_model, "rule: official")),
        RuleMode::Disabled => Ok(Route::new(endpoint, RouteMode::Disabled, requested_model, "rule: disabled")),
        RuleMode::Byok => {
            let Some((provider, fell_back)) = byok_provider(config, &endpoint) else {
                return Err(Error::configuration_with_context(
                    "byok rule but no provider is configured",
                    ErrorContext::new()
                        .with_field_path("providers")
                        .with_details(format!("endpoint {}", endpoint))
                        .with_source("router"),
                ));
            };
            if fell_back {
                tracing::debug!(
                    endpoint = %endpoint,
                    wanted = ?rule.provider_id,
                    provider_id = %provider.id,
                    "Rule provider not found; using the first configured provider"
                );
            }

            let rule_model = rule.model.as_deref().map(str::trim).filter(|m| !m.is_empty());
            let (model, source) = if let Some(m) = rule_model {
                (m.to_string(), "rule model")
            } else if let Some(m) = provider.static_model() {
                (m, "provider model")
            } else if let Some(m) = discovered.iter().map(|m| m.trim()).find(|m| !m.is_empty()) {
                (m.to_string(), "discovered model")
            } else {
                return Err(Error::configuration_with_context(
                    format!("no model could be resolved for provider '{}'", provider.id),
                    ErrorContext::new()
                        .with_field_path(UNRESOLVED_MODEL_FIELD)
                        .with_details(format!("endpoint {}, provider {}", endpoint, provider.id))
                        .with_source("router"),
                ));
            };

            let reason = if fell_back {
                format!("rule: byok (fallback provider), {}", source)
            } else {
                format!("rule: byok, {}", source)
            };
            Ok(Route {
                endpoint,
                mode: RouteMode::Byok,
                provider: Some(provider.clone()),
                model: Some(model),
                requested_model,
                reason,
            })
        }
    }
}

/// Provider a `byok` rule of `endpoint` resolves to, and whether the first configured
/// provider was used because the rule's id did not match.
pub fn byok_provider<'a>(config: &'a BridgeConfig, endpoint: &str) -> Option<(&'a ProviderConfig, bool)> {
    let rule = config.rule_for(endpoint).filter(|r| r.mode == RuleMode::Byok)?;
    let wanted = rule.provider_id.as_deref().map(str::trim).filter(|id| !id.is_empty());
    match wanted.and_then(|id| config.provider(id)) {
        Some(p) => Some((p, false)),
        None => config.providers.first().map(|p| (p, true)),
    }
}

/// Body returned for a disabled endpoint instead of calling any backend.
pub fn disabled_stub(endpoint: &str) -> Value {
    tracing::debug!(endpoint = %normalize_endpoint(endpoint), "Endpoint disabled; returning stub");
    Value::Object(Default::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderType, RouteRule};
    use serde_json::json;

    fn config() -> BridgeConfig {
        let mut config = BridgeConfig {
            enabled: true,
            providers: vec![ProviderConfig::new("p1", ProviderType::OpenAiCompatible, "https://x/v1")
                .with_models(&["m1"])
                .with_default_model("m1")],
            ..Default::default()
        };
        config.routing.rules.insert("/get-models".into(), RouteRule::byok("p1"));
        config.routing.rules.insert("record-session-events".into(), RouteRule::disabled());
        config
    }

    #[test]
    fn test_runtime_disabled_is_always_official() {
        let config = config();
        for endpoint in ["/get-models", "/record-session-events", "/anything"] {
            let route = decide_route(&config, endpoint, &json!({}), false).unwrap();
            assert_eq!(route.mode, RouteMode::Official);
            assert!(route.provider.is_none() && route.model.is_none());
        }
    }

    #[test]
    fn test_byok_scenario() {
        let route = decide_route(&config(), "/get-models", &json!({"model": "client-model"}), true).unwrap();
        assert_eq!(route.mode, RouteMode::Byok);
        assert_eq!(route.provider_id(), Some("p1"));
        assert_eq!(route.model.as_deref(), Some("m1"));
        assert_eq!(route.requested_model.as_deref(), Some("client-model"));
    }

    #[test]
    fn test_disabled_and_unmatched() {
        let config = config();
        let route = decide_route(&config, "/record-session-events/", &json!({}), true).unwrap();
        assert_eq!(route.mode, RouteMode::Disabled);
        assert_eq!(disabled_stub("/record-session-events"), json!({}));
        let route = decide_route(&config, "/chat-stream", &json!({}), true).unwrap();
        assert_eq!(route.mode, RouteMode::Official);
    }

    #[test]
    fn test_unknown_provider_falls_back_to_first() {
        let mut config = config();
        config.routing.rules.insert("/chat".into(), RouteRule::byok("missing"));
        let route = decide_route(&config, "chat", &json!({}), true).unwrap();
        assert_eq!(route.provider_id(), Some("p1"));
        assert!(route.reason.contains("fallback"));
    }

    #[test]
    fn test_model_chain_and_unresolved() {
        let mut config = config();
        config.providers[0].default_model = None;
        config.providers[0].models.clear();
        let err = decide_route(&config, "/get-models", &json!({}), true).unwrap_err();
        assert!(err.is_unresolved_model());

        let route =
            decide_route_with_models(&config, "/get-models", &json!({}), true, &["".into(), "d1".into()]).unwrap();
        assert_eq!(route.model.as_deref(), Some("d1"));

        let mut rule = RouteRule::byok("p1");
        rule.model = Some("pinned".into());
        config.routing.rules.insert("/get-models".into(), rule);
        let route = decide_route(&config, "/get-models", &json!({}), true).unwrap();
        assert_eq!(route.model.as_deref(), Some("pinned"));
    }

    #[test]
    fn test_byok_without_providers_is_configuration_error() {
        let mut config = config();
        config.providers.clear();
        let err = decide_route(&config, "/get-models", &json!({}), true).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(!err.is_unresolved_model());
    }
}
