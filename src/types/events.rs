//! Intermediate streaming events emitted by backend drivers.
//!
//! Drivers translate their native frames (SSE deltas, content-block events, candidate
//! deltas) into these events; [`crate::pipeline::ChunkAggregator`] turns them into
//! canonical chunks. Tool calls are addressed by `tool_call_id` when the backend repeats
//! it, otherwise by `index`.

use serde::{Deserialize, Serialize};

use super::response::TokenUsageNode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum StreamingEvent {
    /// Partial content delta (text streaming)
    #[serde(rename = "PartialContentDelta")]
    PartialContentDelta { content: String },

    /// Tool call started
    #[serde(rename = "ToolCallStarted")]
    ToolCallStarted {
        tool_call_id: String,
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<u32>,
    },

    /// Partial tool call (arguments streaming)
    #[serde(rename = "PartialToolCall")]
    PartialToolCall {
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        arguments: String, // Partial JSON string
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<u32>,
    },

    /// Tool call arguments are complete. `arguments`, when present, replaces the
    /// accumulated fragments.
    #[serde(rename = "ToolCallEnded")]
    ToolCallEnded {
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        arguments: Option<String>,
    },

    /// Usage report and/or native stop reason
    #[serde(rename = "Metadata")]
    Metadata {
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsageNode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
    },

    /// Backend signalled the end of the stream
    #[serde(rename = "StreamEnd")]
    StreamEnd {
        #[serde(skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },

    /// In-band error reported by the backend
    #[serde(rename = "StreamError")]
    StreamError { error: serde_json::Value },
}

impl StreamingEvent {
    pub fn text(content: impl Into<String>) -> Self {
        StreamingEvent::PartialContentDelta {
            content: content.into(),
        }
    }

    pub fn usage(usage: TokenUsageNode) -> Self {
        StreamingEvent::Metadata {
            usage: Some(usage),
            stop_reason: None,
        }
    }

    pub fn stop(reason: impl Into<String>) -> Self {
        StreamingEvent::Metadata {
            usage: None,
            stop_reason: Some(reason.into()),
        }
    }
}
