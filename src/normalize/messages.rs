//! Fold canonical history + current turn into a neutral turn list, then render it in
//! each backend's message shape.
//!
//! Pairing rules applied while folding:
//! - a tool result whose id was not requested by the preceding assistant turn is an
//!   orphan and is rendered as user text;
//! - a tool use that is never answered in the following user turn is dropped, since
//!   every backend rejects dangling calls.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};

use crate::types::{CanonicalChatRequest, ImageNode, Message, MessageRole, RequestNode, ToolUseNode};

#[derive(Debug, Clone, PartialEq)]
pub enum UserPart {
    Text(String),
    Image(ImageNode),
    ToolResult(PairedToolResult),
}

/// A tool result that matched a preceding tool use.
#[derive(Debug, Clone, PartialEq)]
pub struct PairedToolResult {
    pub tool_use_id: String,
    pub tool_name: String,
    pub content: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    User(Vec<UserPart>),
    Assistant {
        text: String,
        tool_uses: Vec<ToolUseNode>,
    },
}

impl Turn {
    fn is_empty(&self) -> bool {
        match self {
            Turn::User(parts) => parts.is_empty(),
            Turn::Assistant { text, tool_uses } => text.trim().is_empty() && tool_uses.is_empty(),
        }
    }
}

fn user_parts(message: &str, nodes: &[&RequestNode]) -> Vec<UserPart> {
    let mut parts = Vec::new();
    for node in nodes {
        match node {
            RequestNode::ToolResult(r) => parts.push(UserPart::ToolResult(PairedToolResult {
                tool_use_id: r.tool_use_id.clone(),
                tool_name: String::new(),
                content: r.content.clone(),
                is_error: r.is_error,
            })),
            RequestNode::Text(t) if !t.text.trim().is_empty() => parts.push(UserPart::Text(t.text.clone())),
            RequestNode::Image(i) => parts.push(UserPart::Image(i.clone())),
            RequestNode::Text(_) => {}
        }
    }
    if !message.trim().is_empty() {
        parts.push(UserPart::Text(message.to_string()));
    }
    parts
}

/// Neutral turn list of a canonical request.
pub fn fold_turns(request: &CanonicalChatRequest) -> Vec<Turn> {
    let mut raw = Vec::new();
    for exchange in &request.chat_history {
        let nodes: Vec<&RequestNode> = exchange.request_nodes.iter().collect();
        raw.push(Turn::User(user_parts(&exchange.request_message, &nodes)));
        raw.push(Turn::Assistant {
            text: exchange.response_text.clone(),
            tool_uses: exchange.response_nodes.clone(),
        });
    }
    let current: Vec<&RequestNode> = request.current_nodes().collect();
    raw.push(Turn::User(user_parts(&request.message, &current)));
    pair_tool_calls(raw)
}

/// Turns for plain role + text messages.
pub fn turns_from_messages(messages: &[Message]) -> Vec<Turn> {
    messages
        .iter()
        .filter(|m| !m.content.is_empty())
        .map(|m| match m.role {
            MessageRole::User => Turn::User(vec![UserPart::Text(m.content.clone())]),
            MessageRole::Assistant => Turn::Assistant {
                text: m.content.clone(),
                tool_uses: Vec::new(),
            },
        })
        .collect()
}

fn pair_tool_calls(raw: Vec<Turn>) -> Vec<Turn> {
    let mut turns = raw;
    for i in 0..turns.len() {
        let (answered, names): (HashSet<String>, HashMap<String, String>) = {
            let requested: HashMap<String, String> = match i.checked_sub(1).map(|p| &turns[p]) {
                Some(Turn::Assistant { tool_uses, .. }) => tool_uses
                    .iter()
                    .map(|u| (u.tool_use_id.clone(), u.tool_name.clone()))
                    .collect(),
                _ => HashMap::new(),
            };
            let answered = match &turns[i] {
                Turn::User(parts) => parts
                    .iter()
                    .filter_map(|p| match p {
                        UserPart::ToolResult(r) if requested.contains_key(&r.tool_use_id) => {
                            Some(r.tool_use_id.clone())
                        }
                        _ => None,
                    })
                    .collect(),
                _ => HashSet::new(),
            };
            (answered, requested)
        };

        if let Turn::User(parts) = &mut turns[i] {
            let mut seen = HashSet::new();
            for part in parts.iter_mut() {
                if let UserPart::ToolResult(r) = part {
                    match names.get(&r.tool_use_id) {
                        Some(name) if seen.insert(r.tool_use_id.clone()) => r.tool_name = name.clone(),
                        _ => {
                            tracing::debug!(tool_use_id = %r.tool_use_id, "Rendering orphan tool result as text");
                            let text = format!("Tool result ({}):\n{}", r.tool_use_id, r.content);
                            *part = UserPart::Text(text);
                        }
                    }
                }
            }
            // Tool results lead the turn; backends expect them right after the call.
            parts.sort_by_key(|p| !matches!(p, UserPart::ToolResult(_)));
        }
        if i > 0 {
            if let Turn::Assistant { tool_uses, .. } = &mut turns[i - 1] {
                tool_uses.retain(|u| answered.contains(&u.tool_use_id));
            }
        }
    }
    // The final turn is the user's; an assistant turn can only precede it.
    turns.into_iter().filter(|t| !t.is_empty()).collect()
}

fn text_of(parts: &[UserPart]) -> String {
    parts
        .iter()
        .filter_map(|p| match p {
            UserPart::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn has_images(parts: &[UserPart]) -> bool {
    parts.iter().any(|p| matches!(p, UserPart::Image(_)))
}

/// OpenAI chat-completions `messages[]`.
pub fn openai_chat_messages(system_prompt: &str, turns: &[Turn]) -> Vec<Value> {
    let mut out = Vec::new();
    if !system_prompt.trim().is_empty() {
        out.push(json!({"role": "system", "content": system_prompt}));
    }
    for turn in turns {
        match turn {
            Turn::User(parts) => {
                for part in parts {
                    if let UserPart::ToolResult(r) = part {
                        out.push(json!({
                            "role": "tool",
                            "tool_call_id": r.tool_use_id,
                            "content": r.content,
                        }));
                    }
                }
                if has_images(parts) {
                    let content: Vec<Value> = parts
                        .iter()
                        .filter_map(|p| match p {
                            UserPart::Text(t) => Some(json!({"type": "text", "text": t})),
                            UserPart::Image(i) => Some(json!({
                                "type": "image_url",
                                "image_url": {"url": i.data_url()},
                            })),
                            UserPart::ToolResult(_) => None,
                        })
                        .collect();
                    out.push(json!({"role": "user", "content": content}));
                } else {
                    let text = text_of(parts);
                    if !text.is_empty() {
                        out.push(json!({"role": "user", "content": text}));
                    }
                }
            }
            Turn::Assistant { text, tool_uses } => {
                let mut msg = json!({
                    "role": "assistant",
                    "content": if text.is_empty() { Value::Null } else { Value::String(text.clone()) },
                });
                if !tool_uses.is_empty() {
                    msg["tool_calls"] = Value::Array(
                        tool_uses
                            .iter()
                            .map(|u| {
                                json!({
                                    "id": u.tool_use_id,
                                    "type": "function",
                                    "function": {"name": u.tool_name, "arguments": u.input_json},
                                })
                            })
                            .collect(),
                    );
                }
                out.push(msg);
            }
        }
    }
    out
}

/// OpenAI responses `instructions` + `input[]`.
pub fn responses_input(system_prompt: &str, turns: &[Turn]) -> (Option<String>, Vec<Value>) {
    let instructions = Some(system_prompt.to_string()).filter(|s| !s.trim().is_empty());
    let mut input = Vec::new();
    for turn in turns {
        match turn {
            Turn::User(parts) => {
                let mut content = Vec::new();
                for part in parts {
                    match part {
                        UserPart::ToolResult(r) => input.push(json!({
                            "type": "function_call_output",
                            "call_id": r.tool_use_id,
                            "output": r.content,
                        })),
                        UserPart::Text(t) => content.push(json!({"type": "input_text", "text": t})),
                        UserPart::Image(i) => content.push(json!({
                            "type": "input_image",
                            "image_url": i.data_url(),
                        })),
                    }
                }
                if !content.is_empty() {
                    input.push(json!({"role": "user", "content": content}));
                }
            }
            Turn::Assistant { text, tool_uses } => {
                if !text.is_empty() {
                    input.push(json!({
                        "role": "assistant",
                        "content": [{"type": "output_text", "text": text}],
                    }));
                }
                for u in tool_uses {
                    input.push(json!({
                        "type": "function_call",
                        "call_id": u.tool_use_id,
                        "name": u.tool_name,
                        "arguments": u.input_json,
                    }));
                }
            }
        }
    }
    (instructions, input)
}

/// Anthropic `messages[]` (system travels separately). Consecutive same-role turns are merged.
pub fn anthropic_messages(turns: &[Turn]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for turn in turns {
        let (role, blocks) = match turn {
            Turn::User(parts) => {
                let blocks: Vec<Value> = parts
                    .iter()
                    .map(|p| match p {
                        UserPart::ToolResult(r) => json!({
                            "type": "tool_result",
                            "tool_use_id": r.tool_use_id,
                            "content": r.content,
                            "is_error": r.is_error,
                        }),
                        UserPart::Text(t) => json!({"type": "text", "text": t}),
                        UserPart::Image(i) => json!({
                            "type": "image",
                            "source": {"type": "base64", "media_type": i.media_type, "data": i.data},
                        }),
                    })
                    .collect();
                ("user", blocks)
            }
            Turn::Assistant { text, tool_uses } => {
                let mut blocks = Vec::new();
                if !text.trim().is_empty() {
                    blocks.push(json!({"type": "text", "text": text}));
                }
                for u in tool_uses {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": u.tool_use_id,
                        "name": u.tool_name,
                        "input": u.input(),
                    }));
                }
                ("assistant", blocks)
            }
        };
        push_merged(&mut out, role, blocks, "content");
    }
    out
}

/// Gemini `contents[]` with `user`/`model` roles.
pub fn gemini_contents(turns: &[Turn]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for turn in turns {
        let (role, parts) = match turn {
            Turn::User(parts) => {
                let parts: Vec<Value> = parts
                    .iter()
                    .map(|p| match p {
                        UserPart::ToolResult(r) => json!({
                            "functionResponse": {
                                "name": r.tool_name,
                                "response": if r.is_error {
                                    json!({"error": r.content})
                                } else {
                                    json!({"content": r.content})
                                },
                            }
                        }),
                        UserPart::Text(t) => json!({"text": t}),
                        UserPart::Image(i) => json!({
                            "inlineData": {"mimeType": i.media_type, "data": i.data},
                        }),
                    })
                    .collect();
                ("user", parts)
            }
            Turn::Assistant { text, tool_uses } => {
                let mut parts = Vec::new();
                if !text.trim().is_empty() {
                    parts.push(json!({"text": text}));
                }
                for u in tool_uses {
                    parts.push(json!({"functionCall": {"name": u.tool_name, "args": u.input()}}));
                }
                ("model", parts)
            }
        };
        push_merged(&mut out, role, parts, "parts");
    }
    out
}

fn push_merged(out: &mut Vec<Value>, role: &str, items: Vec<Value>, key: &str) {
    if items.is_empty() {
        return;
    }
    if let Some(last) = out.last_mut() {
        if last["role"] == role {
            if let Some(existing) = last[key].as_array_mut() {
                existing.extend(items);
                return;
            }
        }
    }
    out.push(json!({"role": role, key: items}));
}
