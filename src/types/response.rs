//! Canonical response chunks produced by `chat_stream_chunks`.

use serde::{Deserialize, Serialize};

/// Incremental unit of a streamed chat response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalResponseChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<ResponseNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl CanonicalResponseChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            text: Some(delta.into()),
            ..Default::default()
        }
    }

    pub fn node(node: ResponseNode) -> Self {
        Self {
            nodes: vec![node],
            ..Default::default()
        }
    }

    pub fn terminal(stop_reason: StopReason, nodes: Vec<ResponseNode>) -> Self {
        Self {
            text: None,
            nodes,
            stop_reason: Some(stop_reason),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stop_reason.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseNode {
    ToolUse(ToolUseNode),
    TokenUsage(TokenUsageNode),
}

impl ResponseNode {
    pub fn as_tool_use(&self) -> Option<&ToolUseNode> {
        match self {
            ResponseNode::ToolUse(t) => Some(t),
            _ => None,
        }
    }
}

/// A completed tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseNode {
    pub tool_use_id: String,
    pub tool_name: String,
    /// Arguments as a JSON document (always a serialized object, `{}` when empty).
    pub input_json: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_tool_name: Option<String>,
}

impl ToolUseNode {
    pub fn new(
        tool_use_id: impl Into<String>,
        tool_name: impl Into<String>,
        input_json: impl Into<String>,
    ) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            tool_name: tool_name.into(),
            input_json: input_json.into(),
            mcp_server_name: None,
            mcp_tool_name: None,
        }
    }

    /// Parsed arguments; malformed JSON yields an empty object.
    pub fn input(&self) -> serde_json::Value {
        serde_json::from_str(&self.input_json)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsageNode {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
}

impl TokenUsageNode {
    /// Merge another report into this one. Backends report usage cumulatively, so the
    /// larger value per field wins.
    pub fn merge(&mut self, other: &TokenUsageNode) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
        self.cached_tokens = self.cached_tokens.max(other.cached_tokens);
    }
}

/// Terminal reason of a streamed turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUseRequested,
    MaxTokens,
    Safety,
    Other,
}

impl StopReason {
    /// Map a backend-native finish/stop reason onto the canonical set.
    pub fn from_native(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stop" | "end_turn" | "stop_sequence" | "completed" | "finish_reason_unspecified" => {
                StopReason::EndTurn
            }
            "tool_calls" | "function_call" | "tool_use" | "tool_use_requested" => {
                StopReason::ToolUseRequested
            }
            "length" | "max_tokens" | "max_output_tokens" => StopReason::MaxTokens,
            "content_filter" | "safety" | "recitation" | "blocklist" | "prohibited_content"
            | "refusal" => StopReason::Safety,
            _ => StopReason::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::ToolUseRequested => "tool_use_requested",
            StopReason::MaxTokens => "max_tokens",
            StopReason::Safety => "safety",
            StopReason::Other => "other",
        }
    }
}
