use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::compact::HistoryCompactor;
use crate::config::{BridgeConfig, ProviderConfig};
use crate::context::BridgeContext;
use crate::drivers::{BackendAdapter, ChatCall, ModelDiscovery, ProviderEndpoint, TextCall};
use crate::normalize::{normalize_canonical_request, TaskKind};
use crate::routing::{byok_provider, decide_route, decide_route_with_models, Route};
use crate::transport::HttpTransport;
use crate::types::{CanonicalChatRequest, CanonicalResponseChunk, Message};
use crate::{BoxStream, Error, ErrorContext, Result};

use super::builder::BridgeBuilder;

/// Routing + translation front end used by the host for every intercepted request.
pub struct Bridge {
    pub(crate) config: ArcSwap<BridgeConfig>,
    pub(crate) context: Arc<BridgeContext>,
    pub(crate) transport: Arc<HttpTransport>,
    pub(crate) compactor: Arc<dyn HistoryCompactor>,
    pub(crate) call_timeout: Duration,
    pub(crate) discovery_timeout: Duration,
    pub(crate) chat_system_prompt: String,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("providers", &self.config.load().providers.len())
            .field("call_timeout", &self.call_timeout)
            .field("discovery_timeout", &self.discovery_timeout)
            .finish()
    }
}

impl Bridge {
    pub fn builder(config: BridgeConfig) -> BridgeBuilder {
        BridgeBuilder::new(config)
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Arc<BridgeConfig> {
        self.config.load_full()
    }

    /// Swap in a new configuration; in-flight calls keep their snapshot.
    pub fn update_config(&self, config: BridgeConfig) -> Result<()> {
        config.validate()?;
        self.config.store(Arc::new(config));
        Ok(())
    }

    pub fn context(&self) -> &Arc<BridgeContext> {
        &self.context
    }

    pub fn transport(&self) -> Arc<HttpTransport> {
        self.transport.clone()
    }

    /// Adapter and endpoint of a provider, after checking its configuration.
    pub fn adapter_for(&self, provider: &ProviderConfig) -> Result<(BackendAdapter, ProviderEndpoint)> {
        let provider_type = provider.check()?;
        Ok((
            BackendAdapter::new(provider_type, self.transport.clone()),
            ProviderEndpoint::from_provider(provider),
        ))
    }

    pub async fn list_models(&self, provider: &ProviderConfig, cancel: CancellationToken) -> Result<ModelDiscovery> {
        let (adapter, endpoint) = self.adapter_for(provider)?;
        adapter.list_models(&endpoint, self.discovery_timeout, cancel).await
    }

    /// Route a request. When the pure router cannot resolve a model, the provider's model
    /// list is fetched and routing is retried with it.
    pub async fn route(
        &self,
        endpoint: &str,
        body: &Value,
        runtime_enabled: bool,
        cancel: CancellationToken,
    ) -> Result<Route> {
        let config = self.config();
        match decide_route(&config, endpoint, body, runtime_enabled) {
            Err(e) if e.is_unresolved_model() => {
                let Some((provider, _)) = byok_provider(&config, endpoint) else {
                    return Err(e);
                };
                tracing::debug!(provider_id = %provider.id, "Resolving model through discovery");
                let discovery = self.list_models(provider, cancel).await?;
                decide_route_with_models(&config, endpoint, body, runtime_enabled, &discovery.models)
            }
            other => other,
        }
    }

    fn byok_parts<'a>(&self, route: &'a Route) -> Result<(&'a ProviderConfig, &'a str)> {
        match (&route.provider, &route.model) {
            (Some(provider), Some(model)) if route.is_byok() => Ok((provider, model.as_str())),
            _ => Err(Error::validation_with_context(
                format!("route for {} is {}, not byok", route.endpoint, route.mode.as_str()),
                ErrorContext::new().with_source("bridge"),
            )),
        }
    }

    /// Agentic chat over a `byok` route. Tool definitions of the request are captured
    /// into the bridge context before the call.
    pub async fn chat_stream(
        &self,
        route: &Route,
        body: &Value,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, CanonicalResponseChunk>> {
        let request = normalize_canonical_request(body);
        self.chat_stream_request(route, request, cancel).await
    }

    pub async fn chat_stream_request(
        &self,
        route: &Route,
        request: CanonicalChatRequest,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, CanonicalResponseChunk>> {
        let (provider, model) = self.byok_parts(route)?;
        self.context.capture(&request.tool_definitions, &route.endpoint);
        let request = self.compactor.compact(request, &cancel).await?;
        let (adapter, endpoint) = self.adapter_for(provider)?;
        let call = ChatCall::new(endpoint, model, request)
            .with_system_prompt(self.chat_system_prompt.clone())
            .with_timeout(self.call_timeout)
            .with_cancel(cancel)
            .with_defaults(provider.request_defaults.clone());
        adapter.chat_stream_chunks(&call).await
    }

    fn task_call(&self, route: &Route, body: &Value, cancel: CancellationToken) -> Result<(TaskKind, BackendAdapter, TextCall)> {
        let (provider, model) = self.byok_parts(route)?;
        let kind = TaskKind::from_endpoint(&route.endpoint).ok_or_else(|| {
            Error::validation_with_context(
                format!("{} is not a task endpoint", route.endpoint),
                ErrorContext::new().with_source("bridge"),
            )
        })?;
        let request = normalize_canonical_request(body);
        let prompt = kind.prompt(&request);
        let (adapter, endpoint) = self.adapter_for(provider)?;
        let call = TextCall::new(endpoint, model, vec![Message::user(prompt.user)])
            .with_system_prompt(prompt.system)
            .with_timeout(self.call_timeout)
            .with_cancel(cancel)
            .with_defaults(provider.request_defaults.clone());
        Ok((kind, adapter, call))
    }

    /// One-shot task (completion, edit, next edit, next-edit location, title).
    pub async fn complete_task(&self, route: &Route, body: &Value, cancel: CancellationToken) -> Result<String> {
        let (kind, adapter, call) = self.task_call(route, body, cancel)?;
        let output = adapter.complete_text(&call).await?;
        Ok(kind.finish(&output))
    }

    /// Streaming variant of [`Self::complete_task`]; deltas are passed through unmodified.
    pub async fn stream_task(
        &self,
        route: &Route,
        body: &Value,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, String>> {
        let (_, adapter, call) = self.task_call(route, body, cancel)?;
        adapter.stream_text_deltas(&call).await
    }
}
