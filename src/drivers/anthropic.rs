//! Anthropic Messages 后端驱动：x-api-key 鉴权、内容块与 input_json_delta 流式解析
//!
//! Anthropic Messages API driver. Handles the key differences from OpenAI:
//! - System prompt is a top-level `system` parameter, not part of `messages`.
//! - Content uses typed blocks; tool calls are `tool_use` blocks and results go back as
//!   `tool_result` blocks inside a user message.
//! - Streaming is block-oriented: `content_block_start` / `content_block_delta` /
//!   `content_block_stop`, with `input_json_delta` fragments for tool arguments.
//! - `max_tokens` is required, not optional.
//! - Auth is `x-api-key` plus a pinned `anthropic-version`.

use serde_json::{json, Value};

use crate::config::ProviderType;
use crate::normalize::messages::{anthropic_messages, fold_turns, turns_from_messages};
use crate::normalize::tools::anthropic_tools;
use crate::pipeline::SseFrame;
use crate::types::{StreamingEvent, TokenUsageNode};
use crate::{Error, Result};

use super::{
    ids_from_model_list, join_url, merge_defaults, model_urls, versioned_base, BackendDriver, ChatCall,
    DriverRequest, FrameContext, ProviderEndpoint, TextCall,
};

const DEFAULT_MAX_TOKENS: u32 = 8192;
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnthropicDriver;

impl AnthropicDriver {
    fn authorize(req: &mut DriverRequest, endpoint: &ProviderEndpoint) {
        if let Some(key) = endpoint.api_key() {
            req.set_header("x-api-key", key);
        }
        req.set_header("anthropic-version", ANTHROPIC_VERSION);
        req.apply_custom_headers(&endpoint.credential);
    }

    fn post(endpoint: &ProviderEndpoint, body: Value, stream: bool) -> DriverRequest {
        let url = join_url(&versioned_base(&endpoint.base_url, "v1"), "messages");
        let mut req = DriverRequest::post(url, body, stream);
        Self::authorize(&mut req, endpoint);
        req
    }

    fn body(model: &str, system: &str, messages: Vec<Value>, max_tokens: Option<u32>, stream: bool) -> Value {
        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": stream,
        });
        if !system.trim().is_empty() {
            body["system"] = Value::String(system.to_string());
        }
        body
    }
}

fn block_index(v: &Value) -> Option<u32> {
    v.get("index").and_then(Value::as_u64).map(|i| i as u32)
}

impl BackendDriver for AnthropicDriver {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    fn build_text_request(&self, call: &TextCall, stream: bool) -> Result<DriverRequest> {
        let messages = anthropic_messages(&turns_from_messages(&call.messages));
        let mut body = Self::body(&call.model, &call.system_prompt, messages, call.max_tokens, stream);
        merge_defaults(&mut body, &call.defaults);
        Ok(Self::post(&call.endpoint, body, stream))
    }

    fn build_chat_request(&self, call: &ChatCall) -> Result<DriverRequest> {
        let messages = anthropic_messages(&fold_turns(&call.request));
        let mut body = Self::body(&call.model, &call.system_prompt, messages, call.max_tokens, true);
        let tools = anthropic_tools(&call.request.tool_definitions);
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = json!({"type": "auto"});
        }
        merge_defaults(&mut body, &call.defaults);
        Ok(Self::post(&call.endpoint, body, true))
    }

    fn parse_text_response(&self, body: &Value) -> Result<String> {
        if body.get("type").and_then(Value::as_str) == Some("error") {
            return Err(Error::validation(format!(
                "backend reported an error: {}",
                body.get("error").unwrap_or(body)
            )));
        }
        // Response: { content: [{type: "text", text: "..."}, {type: "tool_use", ...}], stop_reason }
        Ok(body
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<String>()
            })
            .unwrap_or_default())
    }

    fn parse_stream_event(&self, frame: &SseFrame, ctx: &mut FrameContext) -> Result<Vec<StreamingEvent>> {
        let Some(v) = frame.json() else {
            return Ok(Vec::new());
        };
        let kind = v
            .get("type")
            .and_then(Value::as_str)
            .or(frame.event.as_deref())
            .unwrap_or("");

        let events = match kind {
            "message_start" => {
                let usage = v.pointer("/message/usage").filter(|u| u.is_object());
                match usage {
                    Some(u) => {
                        let n = |k: &str| u.get(k).and_then(Value::as_u64).unwrap_or(0);
                        vec![StreamingEvent::usage(TokenUsageNode {
                            input_tokens: n("input_tokens") + n("cache_read_input_tokens"),
                            output_tokens: n("output_tokens"),
                            cached_tokens: n("cache_read_input_tokens"),
                        })]
                    }
                    None => Vec::new(),
                }
            }
            "content_block_start" => {
                let block = v.get("content_block").unwrap_or(&Value::Null);
                let index = block_index(&v);
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => {
                        let id = block.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                        if let Some(i) = index {
                            ctx.tool_indices.insert(i, id.clone());
                        }
                        vec![StreamingEvent::ToolCallStarted {
                            tool_call_id: id,
                            tool_name: block.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                            index,
                        }]
                    }
                    Some("text") => block
                        .get("text")
                        .and_then(Value::as_str)
                        .filter(|t| !t.is_empty())
                        .map(|t| vec![StreamingEvent::text(t)])
                        .unwrap_or_default(),
                    _ => Vec::new(),
                }
            }
            "content_block_delta" => {
                let delta = v.get("delta").unwrap_or(&Value::Null);
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => delta
                        .get("text")
                        .and_then(Value::as_str)
                        .filter(|t| !t.is_empty())
                        .map(|t| vec![StreamingEvent::text(t)])
                        .unwrap_or_default(),
                    Some("input_json_delta") => {
                        let partial = delta.get("partial_json").and_then(Value::as_str).unwrap_or_default();
                        if partial.is_empty() {
                            Vec::new()
                        } else {
                            let index = block_index(&v);
                            vec![StreamingEvent::PartialToolCall {
                                tool_call_id: index.and_then(|i| ctx.tool_indices.get(&i).cloned()),
                                arguments: partial.to_string(),
                                index,
                            }]
                        }
                    }
                    // thinking / signature deltas are not part of the canonical response
                    _ => Vec::new(),
                }
            }
            "content_block_stop" => {
                let index = block_index(&v);
                match index.and_then(|i| ctx.tool_indices.remove(&i)) {
                    Some(id) => vec![StreamingEvent::ToolCallEnded {
                        tool_call_id: Some(id),
                        index,
                        arguments: None,
                    }],
                    None => Vec::new(),
                }
            }
            "message_delta" => {
                let usage = v.get("usage").filter(|u| u.is_object()).map(|u| TokenUsageNode {
                    input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
                    output_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
                    cached_tokens: u.get("cache_read_input_tokens").and_then(Value::as_u64).unwrap_or(0),
                });
                let stop = v.pointer("/delta/stop_reason").and_then(Value::as_str).map(String::from);
                if usage.is_none() && stop.is_none() {
                    Vec::new()
                } else {
                    vec![StreamingEvent::Metadata {
                        usage,
                        stop_reason: stop,
                    }]
                }
            }
            "message_stop" => vec![StreamingEvent::StreamEnd { finish_reason: None }],
            "error" => vec![StreamingEvent::StreamError {
                error: v.get("error").cloned().unwrap_or(v.clone()),
            }],
            // ping and unknown events
            _ => Vec::new(),
        };
        Ok(events)
    }

    fn model_list_urls(&self, endpoint: &ProviderEndpoint) -> Vec<String> {
        model_urls(&endpoint.base_url, "v1")
    }

    fn model_list_request(&self, endpoint: &ProviderEndpoint, url: &str) -> DriverRequest {
        let mut req = DriverRequest::get(url);
        Self::authorize(&mut req, endpoint);
        req
    }

    fn parse_model_list(&self, body: &Value) -> Vec<String> {
        ids_from_model_list(body)
    }
}
