//! Fixed inputs used by the probes.

use serde_json::{json, Value};

use crate::types::{CanonicalChatRequest, Exchange, RequestNode, ToolDef, ToolUseNode};

/// 1x1 red PNG.
pub const RED_PIXEL_PNG_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mP8z8BQDwAEhQGAhKmMIQAAAABJRU5ErkJggg==";

pub const SYNTHETIC_TOOL_NAME: &str = "selftest_echo";

pub const PONG_PROMPT: &str = "Reply with exactly one word: pong";

pub const COUNT_PROMPT: &str = "Count from 1 to 5, separated by spaces. Output nothing else.";

pub const CHAT_PROMPT: &str = "Say hello in at most five words.";

/// Synthetic tool with a nested object and an enum, so every dialect converter is
/// exercised on something non-trivial.
pub fn synthetic_tool() -> ToolDef {
    ToolDef::new(
        SYNTHETIC_TOOL_NAME,
        "Echo a message back. Used to verify tool calling.",
        json!({
            "type": "object",
            "properties": {
                "message": {"type": "string", "description": "Text to echo"},
                "color": {"type": "string", "enum": ["red", "green", "blue", "other"]},
                "options": {
                    "type": "object",
                    "properties": {
                        "uppercase": {"type": "boolean"}
                    },
                    "required": ["uppercase"]
                }
            },
            "required": ["message", "color"]
        }),
    )
}

/// Chat request with the fixture image and the synthetic tool.
pub fn multimodal_tool_request() -> CanonicalChatRequest {
    let mut request = CanonicalChatRequest::from_message(format!(
        "Look at the attached image and name its dominant color. Then call the tool `{}` \
         exactly once with `message` set to \"hello\" and `color` set to that color.",
        SYNTHETIC_TOOL_NAME
    ));
    request.nodes = vec![RequestNode::image(RED_PIXEL_PNG_BASE64, "image/png")];
    request.tool_definitions = vec![synthetic_tool()];
    request
}

/// Follow-up turn answering `uses` with the given results, replaying `original` as history.
pub fn tool_result_followup(
    original: &CanonicalChatRequest,
    assistant_text: &str,
    uses: &[ToolUseNode],
    results: Vec<RequestNode>,
) -> CanonicalChatRequest {
    let mut history = original.chat_history.clone();
    history.push(Exchange {
        request_message: original.message.clone(),
        request_nodes: original.current_nodes().cloned().collect(),
        response_text: assistant_text.to_string(),
        response_nodes: uses.to_vec(),
    });
    CanonicalChatRequest {
        message: String::new(),
        conversation_id: original.conversation_id.clone(),
        chat_history: history,
        tool_definitions: original.tool_definitions.clone(),
        nodes: results,
        ..Default::default()
    }
}

/// Canned tool result content for a tool use in a round-trip probe.
pub fn synthesized_result(tool: &ToolUseNode) -> String {
    json!({
        "ok": true,
        "tool": tool.tool_name,
        "note": "synthesized by the bridge self-test; no side effects were performed"
    })
    .to_string()
}

/// Prompt asking the model to call every tool of a batch in one turn.
pub fn batch_prompt(tools: &[ToolDef]) -> String {
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    format!(
        "This is a connectivity test. In a single response, call each of these tools exactly \
         once, in parallel, with minimal valid arguments: {}. Do not answer in text.",
        names.join(", ")
    )
}

/// Code-editing context shared by the next-edit probes.
pub fn next_edit_request() -> CanonicalChatRequest {
    let mut request = CanonicalChatRequest::from_message("Rename `total` to `sum` everywhere.");
    request.path = "src/stats.rs".into();
    request.lang = "rust".into();
    request.prefix = "pub fn mean(values: &[f64]) -> f64 {\n    let total: f64 = values.iter().sum();\n".into();
    request.selected_code = "    total / values.len() as f64\n".into();
    request.suffix = "}\n".into();
    request.instruction = "Rename `total` to `sum` everywhere.".into();
    request
}

/// Canonical body form of [`next_edit_request`], as a host would send it.
pub fn next_edit_body() -> Value {
    let request = next_edit_request();
    json!({
        "path": request.path,
        "lang": request.lang,
        "prefix": request.prefix,
        "suffix": request.suffix,
        "selected_code": request.selected_code,
        "instruction": request.instruction,
    })
}
