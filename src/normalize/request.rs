//! Defensive coercion of raw agent request bodies into [`CanonicalChatRequest`].
//!
//! Missing arrays become empty, missing strings become `""`, unknown fields are dropped.
//! Both snake_case and camelCase spellings are accepted; the canonical struct always
//! serializes snake_case.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{Map, Value};

use crate::types::{
    dedupe_tool_definitions, CanonicalChatRequest, Exchange, ImageNode, RequestNode, TextNode,
    ToolDef, ToolResultNode, ToolUseNode,
};

fn field<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .find_map(|n| obj.get(*n))
        .filter(|v| !v.is_null())
}

fn string(obj: &Map<String, Value>, names: &[&str]) -> String {
    match field(obj, names) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn opt_string(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    Some(string(obj, names)).filter(|s| !s.trim().is_empty())
}

fn array<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> &'a [Value] {
    match field(obj, names) {
        Some(Value::Array(a)) => a.as_slice(),
        _ => &[],
    }
}

fn boolean(obj: &Map<String, Value>, names: &[&str]) -> bool {
    match field(obj, names) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Coerce a raw body. Never fails: a non-object body yields the empty request.
pub fn normalize_canonical_request(raw: &Value) -> CanonicalChatRequest {
    let Some(obj) = raw.as_object() else {
        tracing::debug!("Request body is not an object; using empty canonical request");
        return CanonicalChatRequest::default();
    };

    let tools: Vec<ToolDef> = array(obj, &["tool_definitions", "toolDefinitions", "tools"])
        .iter()
        .filter_map(normalize_tool_definition)
        .collect();

    CanonicalChatRequest {
        message: string(obj, &["message", "prompt"]),
        conversation_id: string(obj, &["conversation_id", "conversationId"]),
        chat_history: array(obj, &["chat_history", "chatHistory"])
            .iter()
            .filter_map(normalize_exchange)
            .collect(),
        tool_definitions: dedupe_tool_definitions(&tools),
        nodes: normalize_nodes(array(obj, &["nodes"])),
        request_nodes: normalize_nodes(array(obj, &["request_nodes", "requestNodes"])),
        mode: string(obj, &["mode"]),
        path: string(obj, &["path"]),
        lang: string(obj, &["lang", "language"]),
        prefix: string(obj, &["prefix"]),
        suffix: string(obj, &["suffix"]),
        selected_code: string(obj, &["selected_code", "selectedCode", "selected_text", "selectedText"]),
        instruction: string(obj, &["instruction"]),
        feature_flags: match field(obj, &["feature_flags", "featureFlags"]) {
            Some(Value::Object(m)) => m.clone(),
            _ => Map::new(),
        },
    }
}

/// Tool definition from either spelling; `input_schema_json` strings are parsed.
pub fn normalize_tool_definition(raw: &Value) -> Option<ToolDef> {
    let obj = raw.as_object()?;
    // OpenAI-shaped `{type:"function", function:{...}}` input is unwrapped.
    let obj = match obj.get("function") {
        Some(Value::Object(inner)) => inner,
        _ => obj,
    };
    let name = string(obj, &["name"]);
    if name.trim().is_empty() {
        return None;
    }
    let schema = match field(obj, &["input_schema", "inputSchema", "parameters"]) {
        Some(v @ Value::Object(_)) => Some(v.clone()),
        Some(Value::String(s)) => serde_json::from_str(s).ok(),
        _ => None,
    }
    .or_else(|| match field(obj, &["input_schema_json", "inputSchemaJson"]) {
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "Tool input_schema_json is not valid JSON");
                None
            }
        },
        Some(v @ Value::Object(_)) => Some(v.clone()),
        _ => None,
    })
    .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}}));

    let mut tool = ToolDef::new(name, string(obj, &["description"]), schema);
    tool.mcp_server_name = opt_string(obj, &["mcp_server_name", "mcpServerName"]);
    tool.mcp_tool_name = opt_string(obj, &["mcp_tool_name", "mcpToolName"]);
    Some(tool)
}

fn normalize_exchange(raw: &Value) -> Option<Exchange> {
    let obj = raw.as_object()?;
    Some(Exchange {
        request_message: string(obj, &["request_message", "requestMessage"]),
        request_nodes: normalize_nodes(array(obj, &["request_nodes", "requestNodes"])),
        response_text: string(
            obj,
            &["response_text", "responseText", "response_message", "responseMessage"],
        ),
        response_nodes: array(obj, &["response_nodes", "responseNodes"])
            .iter()
            .filter_map(normalize_tool_use)
            .collect(),
    })
}

/// Response-side tool use from history. Non-tool-use nodes are skipped.
fn normalize_tool_use(raw: &Value) -> Option<ToolUseNode> {
    let obj = raw.as_object()?;
    let inner = match field(obj, &["tool_use", "toolUse"]) {
        Some(Value::Object(m)) => m,
        _ => {
            let kind = field(obj, &["type"]);
            let is_tool_use = match kind {
                Some(Value::String(s)) => s == "tool_use",
                Some(Value::Number(n)) => n.as_i64() == Some(5),
                _ => obj.contains_key("tool_use_id") || obj.contains_key("toolUseId"),
            };
            if !is_tool_use {
                return None;
            }
            obj
        }
    };
    let id = string(inner, &["tool_use_id", "toolUseId", "id"]);
    let name = string(inner, &["tool_name", "toolName", "name"]);
    if id.is_empty() || name.is_empty() {
        return None;
    }
    let input_json = match field(inner, &["input_json", "inputJson", "input"]) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(v @ Value::Object(_)) => v.to_string(),
        _ => "{}".to_string(),
    };
    let mut node = ToolUseNode::new(id, name, input_json);
    node.mcp_server_name = opt_string(inner, &["mcp_server_name", "mcpServerName"]);
    node.mcp_tool_name = opt_string(inner, &["mcp_tool_name", "mcpToolName"]);
    Some(node)
}

fn normalize_nodes(raw: &[Value]) -> Vec<RequestNode> {
    raw.iter().filter_map(normalize_node).collect()
}

#[derive(Clone, Copy)]
enum NodeKind {
    Text,
    ToolResult,
    Image,
}

fn node_kind(obj: &Map<String, Value>) -> Option<NodeKind> {
    match field(obj, &["type"]) {
        Some(Value::Number(n)) => match n.as_i64() {
            Some(0) => return Some(NodeKind::Text),
            Some(1) => return Some(NodeKind::ToolResult),
            Some(2) => return Some(NodeKind::Image),
            _ => {}
        },
        Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "text" | "0" => return Some(NodeKind::Text),
            "tool_result" | "toolresult" | "1" => return Some(NodeKind::ToolResult),
            "image" | "2" => return Some(NodeKind::Image),
            _ => {}
        },
        _ => {}
    }
    if field(obj, &["tool_result_node", "toolResultNode"]).is_some() {
        Some(NodeKind::ToolResult)
    } else if field(obj, &["image_node", "imageNode"]).is_some() {
        Some(NodeKind::Image)
    } else if field(obj, &["text_node", "textNode", "text"]).is_some() {
        Some(NodeKind::Text)
    } else {
        None
    }
}

fn sub_object<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> &'a Map<String, Value> {
    match field(obj, names) {
        Some(Value::Object(m)) => m,
        _ => obj,
    }
}

fn normalize_node(raw: &Value) -> Option<RequestNode> {
    let obj = raw.as_object()?;
    match node_kind(obj)? {
        NodeKind::Text => {
            let inner = sub_object(obj, &["text_node", "textNode"]);
            let text = string(inner, &["content", "text"]);
            Some(RequestNode::Text(TextNode { text }))
        }
        NodeKind::ToolResult => {
            let inner = sub_object(obj, &["tool_result_node", "toolResultNode"]);
            let tool_use_id = string(inner, &["tool_use_id", "toolUseId"]);
            if tool_use_id.is_empty() {
                return None;
            }
            Some(RequestNode::ToolResult(ToolResultNode {
                tool_use_id,
                content: tool_result_content(inner),
                is_error: boolean(inner, &["is_error", "isError"]),
            }))
        }
        NodeKind::Image => {
            let inner = sub_object(obj, &["image_node", "imageNode"]);
            let raw = string(inner, &["image_data", "imageData", "data"]);
            let (url_media_type, data) = split_data_url(&raw);
            if data.is_empty() {
                return None;
            }
            if BASE64.decode(data.as_bytes()).is_err() {
                tracing::debug!("Dropping image node with invalid base64 payload");
                return None;
            }
            let media_type = match field(inner, &["media_type", "mediaType", "format", "mime_type", "mimeType"]) {
                Some(Value::Number(n)) => image_format_code(n.as_i64().unwrap_or(0)).to_string(),
                Some(Value::String(s)) if s.contains('/') => s.clone(),
                Some(Value::String(s)) => format!("image/{}", s.to_ascii_lowercase()),
                _ => url_media_type.unwrap_or("image/png").to_string(),
            };
            Some(RequestNode::Image(ImageNode {
                data: data.to_string(),
                media_type,
            }))
        }
    }
}

/// `data:<type>;base64,<payload>` → (type, payload); anything else is the payload itself.
fn split_data_url(raw: &str) -> (Option<&str>, &str) {
    let raw = raw.trim();
    match raw.strip_prefix("data:").and_then(|rest| rest.split_once(";base64,")) {
        Some((media_type, payload)) => (Some(media_type).filter(|m| !m.is_empty()), payload),
        None => (None, raw),
    }
}

fn image_format_code(code: i64) -> &'static str {
    match code {
        2 => "image/jpeg",
        3 => "image/gif",
        4 => "image/webp",
        _ => "image/png",
    }
}

/// Tool-result content may be a string or a list of `{type:"text", text}` blocks.
fn tool_result_content(obj: &Map<String, Value>) -> String {
    match field(obj, &["content", "output"]) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| match b {
                Value::String(s) => Some(s.clone()),
                Value::Object(m) => m.get("text").and_then(Value::as_str).map(String::from),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}
