//! Per-provider probes: text, streaming, task prompts, chat and tool calling.
//!
//! Each probe returns `Ok(detail)` or an error; [`super::report::RunLog`] turns that
//! into a recorded [`super::report::TestResult`].

use std::time::Duration;

use futures::StreamExt;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::drivers::{BackendAdapter, ChatCall, ProviderEndpoint, TextCall};
use crate::normalize::{parse_next_edit_locations, validate_instance, TaskKind};
use crate::pipeline::{collect_chunks, CollectedTurn};
use crate::types::{CanonicalChatRequest, Message, RequestNode, ToolResultNode, ToolUseNode};
use crate::{Error, Result};

use super::fixtures::{
    multimodal_tool_request, next_edit_request, synthesized_result, synthetic_tool, tool_result_followup,
    CHAT_PROMPT, COUNT_PROMPT, PONG_PROMPT, SYNTHETIC_TOOL_NAME,
};
use super::tool_probes::check_round_trip_pairing;

const PREVIEW_CHARS: usize = 80;

/// Short single-line preview of model output for report details.
pub(crate) fn preview(text: &str) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_CHARS {
        flat
    } else {
        let cut: String = flat.chars().take(PREVIEW_CHARS).collect();
        format!("{}…", cut)
    }
}

/// A chat turn that produced tool uses, kept for the follow-up probe.
#[derive(Debug, Clone)]
pub(crate) struct ToolTurn {
    pub request: CanonicalChatRequest,
    pub turn: CollectedTurn,
}

/// Everything needed to talk to one provider with one resolved model.
#[derive(Debug, Clone)]
pub(crate) struct ProviderProbe {
    adapter: BackendAdapter,
    endpoint: ProviderEndpoint,
    model: String,
    defaults: Map<String, Value>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl ProviderProbe {
    pub fn new(
        adapter: BackendAdapter,
        endpoint: ProviderEndpoint,
        model: impl Into<String>,
        defaults: Map<String, Value>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            endpoint,
            model: model.into(),
            defaults,
            timeout,
            cancel,
        }
    }

    fn text_call(&self, system: &str, user: &str) -> TextCall {
        TextCall::new(self.endpoint.clone(), self.model.clone(), vec![Message::user(user)])
            .with_system_prompt(system)
            .with_timeout(self.timeout)
            .with_cancel(self.cancel.clone())
            .with_defaults(self.defaults.clone())
    }

    /// Run one chat turn to completion.
    pub async fn chat(&self, request: CanonicalChatRequest) -> Result<CollectedTurn> {
        let call = ChatCall::new(self.endpoint.clone(), self.model.clone(), request)
            .with_timeout(self.timeout)
            .with_cancel(self.cancel.clone())
            .with_defaults(self.defaults.clone());
        let stream = self.adapter.chat_stream_chunks(&call).await?;
        collect_chunks(stream).await
    }

    pub async fn complete_text(&self) -> Result<String> {
        let out = self.adapter.complete_text(&self.text_call("", PONG_PROMPT)).await?;
        if out.trim().is_empty() {
            return Err(Error::runtime("completion returned no text"));
        }
        Ok(format!("reply: {}", preview(&out)))
    }

    pub async fn stream_text(&self) -> Result<String> {
        let mut stream = self.adapter.stream_text_deltas(&self.text_call("", COUNT_PROMPT)).await?;
        let mut deltas = 0usize;
        let mut text = String::new();
        while let Some(delta) = stream.next().await {
            text.push_str(&delta?);
            deltas += 1;
        }
        if text.trim().is_empty() {
            return Err(Error::runtime("stream ended without text"));
        }
        Ok(format!("{} deltas: {}", deltas, preview(&text)))
    }

    /// Next-edit and next-edit-location prompts over the fixture file.
    pub async fn task(&self, kind: TaskKind) -> Result<String> {
        let prompt = kind.prompt(&next_edit_request());
        let raw = self
            .adapter
            .complete_text(&self.text_call(&prompt.system, &prompt.user))
            .await?;
        let out = kind.finish(&raw);
        if kind == TaskKind::NextEditLocation {
            let locations = parse_next_edit_locations(&out);
            return match locations.first() {
                Some(first) => Ok(format!(
                    "{} location(s), first {}:{}-{}",
                    locations.len(),
                    first.path,
                    first.line_start,
                    first.line_end
                )),
                None => Err(Error::runtime(format!("no location in reply: {}", preview(&out)))),
            };
        }
        if out.trim().is_empty() {
            return Err(Error::runtime("task returned no text"));
        }
        Ok(format!("{} chars: {}", out.chars().count(), preview(&out)))
    }

    pub async fn chat_stream(&self) -> Result<String> {
        let turn = self.chat(CanonicalChatRequest::from_message(CHAT_PROMPT)).await?;
        let stop = turn
            .stop_reason
            .ok_or_else(|| Error::runtime("chat stream ended without a stop reason"))?;
        if turn.text.trim().is_empty() {
            return Err(Error::runtime(format!("no text, stop={}", stop.as_str())));
        }
        Ok(format!(
            "{} chunks, stop={}: {}",
            turn.chunk_count,
            stop.as_str(),
            preview(&turn.text)
        ))
    }

    /// Image + synthetic tool in one request; the tool call arguments must validate
    /// against the tool schema.
    pub async fn synthetic_tool(&self) -> Result<(String, ToolTurn)> {
        let request = multimodal_tool_request();
        let turn = self.chat(request.clone()).await?;
        let call = turn
            .tool_uses()
            .into_iter()
            .find(|u| u.tool_name == SYNTHETIC_TOOL_NAME)
            .cloned()
            .ok_or_else(|| Error::ToolRoundTrip {
                tool: SYNTHETIC_TOOL_NAME.into(),
                reason: format!("model did not call the tool; reply: {}", preview(&turn.text)),
            })?;
        validate_instance(&synthetic_tool().input_schema, &call.input()).map_err(|issues| Error::SchemaViolation {
            tool: SYNTHETIC_TOOL_NAME.into(),
            issues,
        })?;
        Ok((
            format!("called with {}", preview(&call.input_json)),
            ToolTurn { request, turn },
        ))
    }

    /// Answer every tool use of a tool turn and check the backend accepts the follow-up.
    /// Without a previous turn, a fresh synthetic-tool turn is requested first.
    pub async fn tool_result_round_trip(&self, previous: Option<ToolTurn>) -> Result<String> {
        let tool_turn = match previous {
            Some(t) => t,
            None => self.synthetic_tool().await?.1,
        };
        let uses: Vec<ToolUseNode> = tool_turn.turn.tool_uses().into_iter().cloned().collect();
        let results: Vec<RequestNode> = uses
            .iter()
            .map(|u| RequestNode::tool_result(u.tool_use_id.clone(), synthesized_result(u)))
            .collect();
        check_round_trip_pairing(&uses, &result_nodes(&results))?;

        let followup = tool_result_followup(&tool_turn.request, &tool_turn.turn.text, &uses, results);
        let turn = self.chat(followup).await?;
        let stop = turn
            .stop_reason
            .ok_or_else(|| Error::runtime("follow-up ended without a stop reason"))?;
        if turn.text.trim().is_empty() && turn.tool_uses().is_empty() {
            return Err(Error::ToolRoundTrip {
                tool: SYNTHETIC_TOOL_NAME.into(),
                reason: format!("empty reply after tool result, stop={}", stop.as_str()),
            });
        }
        Ok(format!(
            "{} result(s) accepted, stop={}: {}",
            uses.len(),
            stop.as_str(),
            preview(&turn.text)
        ))
    }
}

pub(crate) fn result_nodes(nodes: &[RequestNode]) -> Vec<ToolResultNode> {
    nodes
        .iter()
        .filter_map(|n| match n {
            RequestNode::ToolResult(r) => Some(r.clone()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_flattens_and_truncates() {
        assert_eq!(preview("a\n  b\tc"), "a b c");
        let long = "x".repeat(200);
        let p = preview(&long);
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 1);
        assert!(p.ends_with('…'));
    }

    #[tokio::test]
    async fn test_synthetic_tool_accepts_strict_nulls_from_responses_backend() {
        use crate::config::{Credential, ProviderType};
        use crate::transport::HttpTransport;
        use std::sync::Arc;

        let mut server = mockito::Server::new_async().await;
        let body = [
            r#"{"type":"response.output_item.added","output_index":0,"item":{"type":"function_call","id":"fc_1","call_id":"call_1","name":"selftest_echo","arguments":""}}"#,
            r#"{"type":"response.function_call_arguments.delta","output_index":0,"item_id":"fc_1","delta":"{\"message\":\"hello\",\"color\":\"red\",\"options\":null}"}"#,
            r#"{"type":"response.output_item.done","output_index":0,"item":{"type":"function_call","id":"fc_1","call_id":"call_1","name":"selftest_echo","arguments":"{\"message\":\"hello\",\"color\":\"red\",\"options\":null}"}}"#,
            r#"{"type":"response.completed","response":{"status":"completed"}}"#,
        ]
        .iter()
        .map(|frame| format!("data: {}\n\n", frame))
        .collect::<String>();
        let _mock = server
            .mock("POST", "/responses")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let transport = Arc::new(HttpTransport::with_client(reqwest::Client::new()));
        let provider = ProviderProbe::new(
            BackendAdapter::new(ProviderType::OpenAiResponses, transport),
            ProviderEndpoint::new(server.url(), Credential::bearer("sk-test-key")),
            "gpt-r",
            Map::new(),
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        let (detail, tool_turn) = provider.synthetic_tool().await.unwrap();
        assert!(detail.contains("hello"));
        let uses = tool_turn.turn.tool_uses();
        assert_eq!(uses[0].input(), serde_json::json!({"message": "hello", "color": "red"}));
    }

    #[test]
    fn test_result_nodes_keeps_only_tool_results() {
        let nodes = vec![RequestNode::text("hi"), RequestNode::tool_result("t1", "ok")];
        let results = result_nodes(&nodes);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tool_use_id, "t1");
    }
}
