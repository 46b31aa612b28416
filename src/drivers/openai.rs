//! OpenAI chat-completions 驱动：兼容所有 OpenAI 风格的 `/chat/completions` 后端
//!
//! OpenAI-compatible chat-completions driver. Streaming requests ask for a final usage
//! chunk via `stream_options.include_usage`, so the finish reason arrives before usage
//! and both are reported as metadata; the stream itself ends on `[DONE]`.

use serde_json::{json, Value};

use crate::config::ProviderType;
use crate::normalize::messages::{fold_turns, openai_chat_messages, turns_from_messages};
use crate::normalize::tools::openai_chat_tools;
use crate::pipeline::{PipelineError, SseFrame};
use crate::types::{StreamingEvent, TokenUsageNode};
use crate::{Error, Result};

use super::{
    ids_from_model_list, join_url, merge_defaults, model_urls, BackendDriver, ChatCall, DriverRequest,
    FrameContext, ProviderEndpoint, TextCall,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAiDriver;

impl OpenAiDriver {
    fn authorize(req: &mut DriverRequest, endpoint: &ProviderEndpoint) {
        if let Some(key) = endpoint.api_key() {
            req.set_header("Authorization", format!("Bearer {}", key));
        }
        req.apply_custom_headers(&endpoint.credential);
    }

    fn post(endpoint: &ProviderEndpoint, mut body: Value, stream: bool) -> DriverRequest {
        if stream {
            body["stream_options"] = json!({"include_usage": true});
        }
        let mut req = DriverRequest::post(join_url(&endpoint.base_url, "chat/completions"), body, stream);
        Self::authorize(&mut req, endpoint);
        req
    }
}

pub(crate) fn usage_from_openai(u: &Value) -> Option<TokenUsageNode> {
    if !u.is_object() {
        return None;
    }
    let n = |ptr: &str| u.pointer(ptr).and_then(Value::as_u64).unwrap_or(0);
    Some(TokenUsageNode {
        input_tokens: n("/prompt_tokens"),
        output_tokens: n("/completion_tokens"),
        cached_tokens: n("/prompt_tokens_details/cached_tokens"),
    })
}

impl BackendDriver for OpenAiDriver {
    fn provider_type(&self) -> ProviderType {
        ProviderType::OpenAiCompatible
    }

    fn build_text_request(&self, call: &TextCall, stream: bool) -> Result<DriverRequest> {
        let turns = turns_from_messages(&call.messages);
        let mut body = json!({
            "model": call.model,
            "messages": openai_chat_messages(&call.system_prompt, &turns),
            "stream": stream,
        });
        if let Some(max) = call.max_tokens {
            body["max_tokens"] = json!(max);
        }
        merge_defaults(&mut body, &call.defaults);
        Ok(Self::post(&call.endpoint, body, stream))
    }

    fn build_chat_request(&self, call: &ChatCall) -> Result<DriverRequest> {
        let turns = fold_turns(&call.request);
        let mut body = json!({
            "model": call.model,
            "messages": openai_chat_messages(&call.system_prompt, &turns),
            "stream": true,
        });
        let tools = openai_chat_tools(&call.request.tool_definitions);
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = json!("auto");
        }
        if let Some(max) = call.max_tokens {
            body["max_tokens"] = json!(max);
        }
        merge_defaults(&mut body, &call.defaults);
        Ok(Self::post(&call.endpoint, body, true))
    }

    fn parse_text_response(&self, body: &Value) -> Result<String> {
        if let Some(err) = body.get("error").filter(|e| !e.is_null()) {
            return Err(Error::validation(format!("backend reported an error: {}", err)));
        }
        let content = body.pointer("/choices/0/message/content");
        match content {
            Some(Value::String(s)) => Ok(s.clone()),
            // Some gateways return content as typed parts.
            Some(Value::Array(parts)) => Ok(parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect()),
            _ => Ok(String::new()),
        }
    }

    fn parse_stream_event(&self, frame: &SseFrame, ctx: &mut FrameContext) -> Result<Vec<StreamingEvent>> {
        let Some(v) = frame.json() else {
            tracing::debug!(data = %frame.data, "Skipping non-JSON chat-completions frame");
            return Ok(Vec::new());
        };
        if let Some(err) = v.get("error").filter(|e| !e.is_null()) {
            return Ok(vec![StreamingEvent::StreamError { error: err.clone() }]);
        }

        let mut events = Vec::new();
        if let Some(choice) = v.pointer("/choices/0") {
            let delta = choice.get("delta").unwrap_or(&Value::Null);
            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                if !text.is_empty() {
                    events.push(StreamingEvent::text(text));
                }
            }
            if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                for (pos, call) in calls.iter().enumerate() {
                    let index = call
                        .get("index")
                        .and_then(Value::as_u64)
                        .map(|i| i as u32)
                        .unwrap_or(pos as u32);
                    let id = call.get("id").and_then(Value::as_str).filter(|s| !s.is_empty());
                    let name = call.pointer("/function/name").and_then(Value::as_str);
                    // Some gateways repeat (or omit) the index across parallel calls; a new
                    // id on an open slot starts a new call.
                    let starts = match (ctx.tool_indices.get(&index), id) {
                        (None, _) => id.is_some() || name.is_some(),
                        (Some(open), Some(id)) => open != id,
                        (Some(_), None) => false,
                    };
                    if starts {
                        if let Some(open) = ctx.tool_indices.remove(&index).filter(|o| !o.is_empty()) {
                            events.push(StreamingEvent::ToolCallEnded {
                                tool_call_id: Some(open),
                                index: Some(index),
                                arguments: None,
                            });
                        }
                        let id = id.map(String::from).unwrap_or_default();
                        ctx.tool_indices.insert(index, id.clone());
                        events.push(StreamingEvent::ToolCallStarted {
                            tool_call_id: id,
                            tool_name: name.unwrap_or_default().to_string(),
                            index: Some(index),
                        });
                    }
                    if let Some(args) = call.pointer("/function/arguments").and_then(Value::as_str) {
                        if !args.is_empty() {
                            events.push(StreamingEvent::PartialToolCall {
                                tool_call_id: None,
                                arguments: args.to_string(),
                                index: Some(index),
                            });
                        }
                    }
                }
            }
            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                events.push(StreamingEvent::stop(reason));
            }
        } else if v.get("choices").is_none() && v.get("usage").is_none() {
            return Err(PipelineError::MalformedFrame {
                reason: "chat-completions frame without choices".into(),
                hint: None,
            }
            .with_hint("check that the provider type matches the backend API")
            .into());
        }
        if let Some(usage) = v.get("usage").and_then(usage_from_openai) {
            events.push(StreamingEvent::usage(usage));
        }
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
