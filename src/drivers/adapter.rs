//! Backend adapter: driver + shared transport + per-call guard.
//!
//! Every operation applies the caller's deadline and cancellation token to each
//! suspension point (connect, headers, body chunks), so a stalled backend cannot hold a
//! call open past its deadline.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderType;
use crate::pipeline::{aggregate_stream, CallGuard, PipelineError, SseDecoder, SseFrame};
use crate::transport::{redact_url, scrub, HttpTransport};
use crate::types::{CanonicalResponseChunk, StreamingEvent};
use crate::{BoxStream, Error, Result};

use super::{create_driver, BackendDriver, ChatCall, FrameContext, ProviderEndpoint, TextCall};

/// Outcome of model discovery. URLs are redacted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDiscovery {
    pub models: Vec<String>,
    pub attempted_urls: Vec<String>,
    pub url_used: Option<String>,
}

/// Uniform entry point over the four backend families.
#[derive(Debug, Clone)]
pub struct BackendAdapter {
    driver: Arc<dyn BackendDriver>,
    transport: Arc<HttpTransport>,
}

impl BackendAdapter {
    pub fn new(provider_type: ProviderType, transport: Arc<HttpTransport>) -> Self {
        Self {
            driver: Arc::from(create_driver(provider_type)),
            transport,
        }
    }

    pub fn with_driver(driver: Arc<dyn BackendDriver>, transport: Arc<HttpTransport>) -> Self {
        Self { driver, transport }
    }

    pub fn provider_type(&self) -> ProviderType {
        self.driver.provider_type()
    }

    /// One-shot text completion.
    pub async fn complete_text(&self, call: &TextCall) -> Result<String> {
        let guard = CallGuard::new("complete_text", call.timeout, call.cancel.clone());
        let request = self.driver.build_text_request(call, false)?;
        let secrets = call.endpoint.secrets();
        tracing::debug!(provider_type = %self.provider_type(), model = %call.model, "complete_text");
        let body = guard.run(self.transport.send_json(&request, &secrets)).await?;
        self.driver.parse_text_response(&body)
    }

    /// Text deltas in arrival order; tool calls are ignored.
    pub async fn stream_text_deltas(&self, call: &TextCall) -> Result<BoxStream<'static, String>> {
        let guard = CallGuard::new("stream_text_deltas", call.timeout, call.cancel.clone());
        let request = self.driver.build_text_request(call, true)?;
        let secrets = call.endpoint.secrets();
        tracing::debug!(provider_type = %self.provider_type(), model = %call.model, "stream_text_deltas");
        let bytes = guard.run(self.transport.send_stream(&request, &secrets)).await?;
        let events = frames_to_events(self.driver.clone(), SseDecoder::decode(bytes));

        let deltas = events.filter_map(move |item| {
            let out = match item {
                Ok(StreamingEvent::PartialContentDelta { content }) => Some(Ok(content)),
                Ok(StreamingEvent::StreamError { error }) => Some(Err(Error::Pipeline(PipelineError::Upstream(
                    scrub(&error.to_string(), &secrets),
                )))),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            };
            futures::future::ready(out)
        });
        Ok(guard.guard_stream(Box::pin(deltas)))
    }

    /// Agentic chat: canonical chunks with aggregated tool calls and exactly one terminal
    /// chunk.
    pub async fn chat_stream_chunks(&self, call: &ChatCall) -> Result<BoxStream<'static, CanonicalResponseChunk>> {
        let guard = CallGuard::new("chat_stream_chunks", call.timeout, call.cancel.clone());
        let request = self.driver.build_chat_request(call)?;
        let secrets = call.endpoint.secrets();
        tracing::debug!(
            provider_type = %self.provider_type(),
            model = %call.model,
            tools = call.request.tool_definitions.len(),
            "chat_stream_chunks"
        );
        let bytes = guard.run(self.transport.send_stream(&request, &secrets)).await?;
        let events = frames_to_events(self.driver.clone(), SseDecoder::decode(bytes));
        let chunks = aggregate_stream(events, &call.request.tool_definitions, secrets);
        Ok(guard.guard_stream(chunks))
    }

    /// Discover models, falling back to the versioned path when the unprefixed one is 404.
    pub async fn list_models(
        &self,
        endpoint: &ProviderEndpoint,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<ModelDiscovery> {
        let guard = CallGuard::new("list_models", timeout, cancel);
        let secrets = endpoint.secrets();
        let urls = self.driver.model_list_urls(endpoint);
        let mut discovery = ModelDiscovery::default();

        for (i, url) in urls.iter().enumerate() {
            let request = self.driver.model_list_request(endpoint, url);
            let redacted = redact_url(&request.url, &secrets);
            discovery.attempted_urls.push(redacted.clone());
            match guard.run(self.transport.send_json(&request, &secrets)).await {
                Ok(body) => {
                    let mut seen = HashSet::new();
                    discovery.models = self
                        .driver
                        .parse_model_list(&body)
                        .into_iter()
                        .filter(|m| seen.insert(m.clone()))
                        .collect();
                    discovery.url_used = Some(redacted);
                    tracing::debug!(count = discovery.models.len(), url = ?discovery.url_used, "Models discovered");
                    return Ok(discovery);
                }
                Err(e) if e.upstream_status() == Some(404) && i + 1 < urls.len() => {
                    tracing::debug!(url = %redacted, "Model list not found, trying versioned path");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::configuration(format!(
            "no model list URL could be derived from base_url ({})",
            discovery.attempted_urls.join(", ")
        )))
    }
}

/// Feed SSE frames through the driver, flattening each frame's events in order.
fn frames_to_events(
    driver: Arc<dyn BackendDriver>,
    frames: BoxStream<'static, SseFrame>,
) -> BoxStream<'static, StreamingEvent> {
    struct State {
        driver: Arc<dyn BackendDriver>,
        frames: BoxStream<'static, SseFrame>,
        ctx: FrameContext,
        pending: VecDeque<StreamingEvent>,
        failed: bool,
    }

    let state = State {
        driver,
        frames,
        ctx: FrameContext::default(),
        pending: VecDeque::new(),
        failed: false,
    };

    let s = stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.failed {
                return None;
            }
            match state.frames.next().await {
                Some(Ok(frame)) => match state.driver.parse_stream_event(&frame, &mut state.ctx) {
                    Ok(events) => state.pending.extend(events),
                    Err(e) => {
                        state.failed = true;
                        return Some((Err(e), state));
                    }
                },
                Some(Err(e)) => {
                    state.failed = true;
                    return Some((Err(e), state));
                }
                None => return None,
            }
        }
    });
    Box::pin(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_frames_to_events_flattens_in_order() {
        let raw = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let bytes: BoxStream<'static, Bytes> = Box::pin(stream::iter(vec![Ok(Bytes::from(raw))]));
        let driver: Arc<dyn BackendDriver> = Arc::from(create_driver(ProviderType::OpenAiCompatible));
        let events: Vec<StreamingEvent> = frames_to_events(driver, SseDecoder::decode(bytes))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                StreamingEvent::text("a"),
                StreamingEvent::text("b"),
                StreamingEvent::stop("stop"),
            ]
        );
    }
}
