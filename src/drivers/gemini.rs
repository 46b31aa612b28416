//! Gemini generateContent 驱动：key 查询参数鉴权、functionDeclarations 与合成调用 id
//!
//! Google Gemini generateContent API driver. Key differences:
//! - Uses `contents` instead of `messages`, with `parts` instead of `content`.
//! - Roles: `user` and `model` (not `assistant`). System uses `systemInstruction`.
//! - `generationConfig` wraps max tokens (→ `maxOutputTokens`) and sampling knobs.
//! - Streaming goes through `:streamGenerateContent?alt=sse`; every frame is a full
//!   response object with the next slice of `candidates[0].content.parts`.
//! - Function calls arrive complete in one part and usually without an id, so ids are
//!   synthesized.
//! - API key is passed as `?key=` query parameter, not in headers.

use serde_json::{json, Value};

use crate::config::ProviderType;
use crate::normalize::messages::{fold_turns, gemini_contents, turns_from_messages};
use crate::normalize::tools::gemini_tools;
use crate::pipeline::SseFrame;
use crate::types::{StreamingEvent, TokenUsageNode};
use crate::{Error, Result};

use super::{
    ids_from_model_list, join_url, merge_defaults, model_urls, versioned_base, BackendDriver, ChatCall,
    DriverRequest, FrameContext, ProviderEndpoint, TextCall,
};

/// Google Gemini generateContent API driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct GeminiDriver;

impl GeminiDriver {
    fn authorize(req: &mut DriverRequest, endpoint: &ProviderEndpoint) {
        if let Some(key) = endpoint.api_key() {
            req.add_query("key", key);
        }
        req.apply_custom_headers(&endpoint.credential);
    }

    fn generate_url(endpoint: &ProviderEndpoint, model: &str, stream: bool) -> String {
        let model = model.trim().trim_start_matches("models/");
        let action = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        join_url(
            &versioned_base(&endpoint.base_url, "v1beta"),
            &format!("models/{}:{}", model, action),
        )
    }

    fn body(system: &str, contents: Vec<Value>, max_tokens: Option<u32>) -> Value {
        let mut body = json!({ "contents": contents });
        if !system.trim().is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        if let Some(max) = max_tokens {
            body["generationConfig"] = json!({"maxOutputTokens": max});
        }
        body
    }

    fn post(endpoint: &ProviderEndpoint, model: &str, body: Value, stream: bool) -> DriverRequest {
        let mut req = DriverRequest::post(Self::generate_url(endpoint, model, stream), body, stream);
        Self::authorize(&mut req, endpoint);
        req
    }
}

fn candidate_text(body: &Value) -> String {
    body.pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|p| !p.get("thought").and_then(Value::as_bool).unwrap_or(false))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

impl BackendDriver for GeminiDriver {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Gemini
    }

    fn build_text_request(&self, call: &TextCall, stream: bool) -> Result<DriverRequest> {
        let contents = gemini_contents(&turns_from_messages(&call.messages));
        let mut body = Self::body(&call.system_prompt, contents, call.max_tokens);
        merge_defaults(&mut body, &call.defaults);
        Ok(Self::post(&call.endpoint, &call.model, body, stream))
    }

    fn build_chat_request(&self, call: &ChatCall) -> Result<DriverRequest> {
        let contents = gemini_contents(&fold_turns(&call.request));
        let mut body = Self::body(&call.system_prompt, contents, call.max_tokens);
        let tools = gemini_tools(&call.request.tool_definitions);
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
            body["toolConfig"] = json!({"functionCallingConfig": {"mode": "AUTO"}});
        }
        merge_defaults(&mut body, &call.defaults);
        Ok(Self::post(&call.endpoint, &call.model, body, true))
    }

    fn parse_text_response(&self, body: &Value) -> Result<String> {
        if let Some(err) = body.get("error").filter(|e| !e.is_null()) {
            return Err(Error::validation(format!("backend reported an error: {}", err)));
        }
        Ok(candidate_text(body))
    }

    fn parse_stream_event(&self, frame: &SseFrame, ctx: &mut FrameContext) -> Result<Vec<StreamingEvent>> {
        let Some(v) = frame.json() else {
            return Ok(Vec::new());
        };
        if let Some(err) = v.get("error").filter(|e| !e.is_null()) {
            return Ok(vec![StreamingEvent::StreamError { error: err.clone() }]);
        }

        let mut events = Vec::new();
        if let Some(parts) = v.pointer("/candidates/0/content/parts").and_then(Value::as_array) {
            for part in parts {
                if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
                    continue;
                }
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        events.push(StreamingEvent::text(text));
                    }
                }
                if let Some(call) = part.get("functionCall") {
                    let id = call
                        .get("id")
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .unwrap_or_else(|| ctx.next_id("call"));
                    let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                    events.push(StreamingEvent::ToolCallStarted {
                        tool_call_id: id.clone(),
                        tool_name: call.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                        index: None,
                    });
                    events.push(StreamingEvent::ToolCallEnded {
                        tool_call_id: Some(id),
                        index: None,
                        arguments: Some(args.to_string()),
                    });
                }
            }
        }
        if let Some(reason) = v.pointer("/candidates/0/finishReason").and_then(Value::as_str) {
            events.push(StreamingEvent::stop(reason));
        }
        if let Some(u) = v.get("usageMetadata").filter(|u| u.is_object()) {
            let n = |k: &str| u.get(k).and_then(Value::as_u64).unwrap_or(0);
            events.push(StreamingEvent::usage(TokenUsageNode {
                input_tokens: n("promptTokenCount"),
                output_tokens: n("candidatesTokenCount"),
                cached_tokens: n("cachedContentTokenCount"),
            }));
        }
        Ok(events)
    }

    fn model_list_urls(&self, endpoint: &ProviderEndpoint) -> Vec<String> {
        model_urls(&endpoint.base_url, "v1beta")
    }

    fn model_list_request(&self, endpoint: &ProviderEndpoint, url: &str) -> DriverRequest {
        let mut req = DriverRequest::get(url);
        Self::authorize(&mut req, endpoint);
        req
    }

    /// `models/<name>` entries, keeping only those that can generate content.
    fn parse_model_list(&self, body: &Value) -> Vec<String> {
        let Some(models) = body.get("models").and_then(Value::as_array) else {
            return ids_from_model_list(body);
        };
        models
            .iter()
            .filter(|m| {
                m.get("supportedGenerationMethods")
                    .and_then(Value::as_array)
                    .map(|methods| methods.iter().any(|x| x.as_str() == Some("generateContent")))
                    .unwrap_or(true)
            })
            .filter_map(|m| m.get("name").and_then(Value::as_str))
            .map(|name| name.trim_start_matches("models/").to_string())
            .filter(|name| !name.is_empty())
            .collect()
    }
}
