//! OpenAI Responses API driver.
//!
//! Streaming uses typed events (`response.output_text.delta`,
//! `response.output_item.added`, `response.function_call_arguments.delta`, ...). Function
//! call items carry both an item id (used by argument deltas) and a `call_id` (used when
//! the result is sent back); the frame context maps one to the other.

use serde_json::{json, Value};

use crate::config::ProviderType;
use crate::normalize::messages::{fold_turns, responses_input, turns_from_messages};
use crate::normalize::tools::openai_responses_tools;
use crate::pipeline::SseFrame;
use crate::types::{StreamingEvent, TokenUsageNode};
use crate::{Error, Result};

use super::{
    ids_from_model_list, join_url, merge_defaults, model_urls, BackendDriver, ChatCall, DriverRequest,
    FrameContext, ProviderEndpoint, TextCall,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAiResponsesDriver;

impl OpenAiResponsesDriver {
    fn authorize(req: &mut DriverRequest, endpoint: &ProviderEndpoint) {
        if let Some(key) = endpoint.api_key() {
            req.set_header("Authorization", format!("Bearer {}", key));
        }
        req.apply_custom_headers(&endpoint.credential);
    }

    fn body(model: &str, instructions: Option<String>, input: Vec<Value>, stream: bool) -> Value {
        let mut body = json!({
            "model": model,
            "input": input,
            "stream": stream,
            "store": false,
        });
        if let Some(instructions) = instructions {
            body["instructions"] = Value::String(instructions);
        }
        body
    }

    fn post(endpoint: &ProviderEndpoint, body: Value, stream: bool) -> DriverRequest {
        let mut req = DriverRequest::post(join_url(&endpoint.base_url, "responses"), body, stream);
        Self::authorize(&mut req, endpoint);
        req
    }
}

fn usage_from_responses(u: &Value) -> Option<TokenUsageNode> {
    if !u.is_object() {
        return None;
    }
    let n = |ptr: &str| u.pointer(ptr).and_then(Value::as_u64).unwrap_or(0);
    Some(TokenUsageNode {
        input_tokens: n("/input_tokens"),
        output_tokens: n("/output_tokens"),
        cached_tokens: n("/input_tokens_details/cached_tokens"),
    })
}

fn output_index(v: &Value) -> Option<u32> {
    v.get("output_index").and_then(Value::as_u64).map(|i| i as u32)
}

impl BackendDriver for OpenAiResponsesDriver {
    fn provider_type(&self) -> ProviderType {
        ProviderType::OpenAiResponses
    }

    fn build_text_request(&self, call: &TextCall, stream: bool) -> Result<DriverRequest> {
        let turns = turns_from_messages(&call.messages);
        let (instructions, input) = responses_input(&call.system_prompt, &turns);
        let mut body = Self::body(&call.model, instructions, input, stream);
        if let Some(max) = call.max_tokens {
            body["max_output_tokens"] = json!(max);
        }
        merge_defaults(&mut body, &call.defaults);
        Ok(Self::post(&call.endpoint, body, stream))
    }

    fn build_chat_request(&self, call: &ChatCall) -> Result<DriverRequest> {
        let turns = fold_turns(&call.request);
        let (instructions, input) = responses_input(&call.system_prompt, &turns);
        let mut body = Self::body(&call.model, instructions, input, true);
        let tools = openai_responses_tools(&call.request.tool_definitions);
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = json!("auto");
            body["parallel_tool_calls"] = json!(true);
        }
        if let Some(max) = call.max_tokens {
            body["max_output_tokens"] = json!(max);
        }
        merge_defaults(&mut body, &call.defaults);
        Ok(Self::post(&call.endpoint, body, true))
    }

    fn parse_text_response(&self, body: &Value) -> Result<String> {
        if let Some(err) = body.get("error").filter(|e| !e.is_null()) {
            return Err(Error::validation(format!("backend reported an error: {}", err)));
        }
        if let Some(text) = body.get("output_text").and_then(Value::as_str) {
            return Ok(text.to_string());
        }
        let text = body
            .get("output")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter(|i| i.get("type").and_then(Value::as_str) == Some("message"))
                    .filter_map(|i| i.get("content").and_then(Value::as_array))
                    .flatten()
                    .filter(|c| c.get("type").and_then(Value::as_str) == Some("output_text"))
                    .filter_map(|c| c.get("text").and_then(Value::as_str))
                    .collect::<String>()
            })
            .unwrap_or_default();
        Ok(text)
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
            "response.output_text.delta" => v
                .get("delta")
                .and_then(Value::as_str)
                .filter(|d| !d.is_empty())
                .map(|d| vec![StreamingEvent::text(d)])
                .unwrap_or_default(),
            "response.output_item.added" => {
                let item = v.get("item").unwrap_or(&Value::Null);
                if item.get("type").and_then(Value::as_str) != Some("function_call") {
                    return Ok(Vec::new());
                }
                let call_id = item
                    .get("call_id")
                    .or_else(|| item.get("id"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if let Some(item_id) = item.get("id").and_then(Value::as_str) {
                    ctx.item_calls.insert(item_id.to_string(), call_id.clone());
                }
                vec![StreamingEvent::ToolCallStarted {
                    tool_call_id: call_id,
                    tool_name: item.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                    index: output_index(&v),
                }]
            }
            "response.function_call_arguments.delta" => {
                let delta = v.get("delta").and_then(Value::as_str).unwrap_or_default();
                if delta.is_empty() {
                    return Ok(Vec::new());
                }
                let call_id = v
                    .get("item_id")
                    .and_then(Value::as_str)
                    .and_then(|id| ctx.item_calls.get(id).cloned());
                vec![StreamingEvent::PartialToolCall {
                    tool_call_id: call_id,
                    arguments: delta.to_string(),
                    index: output_index(&v),
                }]
            }
            "response.output_item.done" => {
                let item = v.get("item").unwrap_or(&Value::Null);
                if item.get("type").and_then(Value::as_str) != Some("function_call") {
                    return Ok(Vec::new());
                }
                let call_id = item
                    .get("call_id")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .or_else(|| {
                        item.get("id")
                            .and_then(Value::as_str)
                            .and_then(|id| ctx.item_calls.get(id).cloned())
                    });
                vec![StreamingEvent::ToolCallEnded {
                    tool_call_id: call_id,
                    index: output_index(&v),
                    arguments: item.get("arguments").and_then(Value::as_str).map(String::from),
                }]
            }
            "response.completed" | "response.incomplete" => {
                let response = v.get("response").unwrap_or(&Value::Null);
                let mut events = Vec::new();
                if let Some(usage) = response.get("usage").and_then(usage_from_responses) {
                    events.push(StreamingEvent::usage(usage));
                }
                let finish = response
                    .pointer("/incomplete_details/reason")
                    .and_then(Value::as_str)
                    .or_else(|| response.get("status").and_then(Value::as_str))
                    .unwrap_or("completed");
                events.push(StreamingEvent::StreamEnd {
                    finish_reason: Some(finish.to_string()),
                });
                events
            }
            "response.failed" => vec![StreamingEvent::StreamError {
                error: v
                    .pointer("/response/error")
                    .cloned()
                    .filter(|e| !e.is_null())
                    .unwrap_or_else(|| json!({"message": "response failed"})),
            }],
            "error" => vec![StreamingEvent::StreamError {
                error: v.get("error").cloned().unwrap_or(v.clone()),
            }],
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
