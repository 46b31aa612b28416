//! Canonical chat request as sent by the agent client.

use serde::{Deserialize, Serialize};

use super::response::ToolUseNode;
use super::tool::ToolDef;

/// The canonical request, independent of any backend.
///
/// Build it with [`crate::normalize::normalize_canonical_request`] from a raw body; that
/// path accepts camelCase aliases and fills missing fields. Serialization always emits
/// the snake_case form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub chat_history: Vec<Exchange>,
    #[serde(default)]
    pub tool_definitions: Vec<ToolDef>,
    #[serde(default)]
    pub nodes: Vec<RequestNode>,
    #[serde(default)]
    pub request_nodes: Vec<RequestNode>,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub lang: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    #[serde(default)]
    pub selected_code: String,
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub feature_flags: serde_json::Map<String, serde_json::Value>,
}

impl CanonicalChatRequest {
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Nodes of the current turn: `nodes` followed by `request_nodes`.
    pub fn current_nodes(&self) -> impl Iterator<Item = &RequestNode> {
        self.nodes.iter().chain(self.request_nodes.iter())
    }

    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResultNode> {
        self.current_nodes().filter_map(|n| match n {
            RequestNode::ToolResult(r) => Some(r),
            _ => None,
        })
    }
}

/// One prior turn of the conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    #[serde(default)]
    pub request_message: String,
    #[serde(default)]
    pub request_nodes: Vec<RequestNode>,
    #[serde(default)]
    pub response_text: String,
    #[serde(default)]
    pub response_nodes: Vec<ToolUseNode>,
}

impl Exchange {
    pub fn new(request_message: impl Into<String>, response_text: impl Into<String>) -> Self {
        Self {
            request_message: request_message.into(),
            response_text: response_text.into(),
            ..Default::default()
        }
    }

    /// Rough size used by the history compactor.
    pub fn char_len(&self) -> usize {
        let nodes: usize = self
            .request_nodes
            .iter()
            .map(|n| match n {
                RequestNode::Text(t) => t.text.len(),
                RequestNode::ToolResult(r) => r.content.len(),
                RequestNode::Image(_) => 0,
            })
            .sum();
        let uses: usize = self.response_nodes.iter().map(|u| u.input_json.len()).sum();
        self.request_message.len() + self.response_text.len() + nodes + uses
    }
}

/// A node of the user side of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestNode {
    Text(TextNode),
    Image(ImageNode),
    ToolResult(ToolResultNode),
}

impl RequestNode {
    pub fn text(text: impl Into<String>) -> Self {
        RequestNode::Text(TextNode { text: text.into() })
    }

    pub fn image(data: impl Into<String>, media_type: impl Into<String>) -> Self {
        RequestNode::Image(ImageNode {
            data: data.into(),
            media_type: media_type.into(),
        })
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        RequestNode::ToolResult(ToolResultNode {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextNode {
    pub text: String,
}

/// Base64 image payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageNode {
    pub data: String,
    pub media_type: String,
}

impl ImageNode {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultNode {
    pub tool_use_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}
