//! 类型系统模块：规范协议（canonical protocol）的核心数据类型。
//!
//! # Types Module
//!
//! Canonical request/response types shared by the router, the normalizer, the backend
//! drivers and the self-test harness. Canonical types never carry backend field names;
//! only the drivers translate naming.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`CanonicalChatRequest`] | Agent request: message, history, nodes, tool definitions |
//! | [`RequestNode`] | Text, image or tool-result node of a user turn |
//! | [`CanonicalResponseChunk`] | Incremental streamed response unit |
//! | [`ResponseNode`] | Tool-use or token-usage node of a response |
//! | [`ToolDef`] | Tool definition with JSON-Schema input |
//! | [`StreamingEvent`] | Driver-level event before aggregation |
//! | [`Message`] | Role + text for one-shot completions |
//!
//! ## Example
//!
//! ```rust
//! use byok_bridge::types::{CanonicalChatRequest, RequestNode, ToolDef};
//!
//! let mut request = CanonicalChatRequest::from_message("List the files");
//! request.tool_definitions.push(ToolDef::new(
//!     "list_files",
//!     "List files in a directory",
//!     serde_json::json!({"type": "object", "properties": {"dir": {"type": "string"}}}),
//! ));
//! request.nodes.push(RequestNode::text("Only the src directory."));
//! ```

pub mod events;
pub mod message;
pub mod request;
pub mod response;
pub mod tool;

pub use events::StreamingEvent;
pub use message::{Message, MessageRole};
pub use request::{
    CanonicalChatRequest, Exchange, ImageNode, RequestNode, TextNode, ToolResultNode,
};
pub use response::{CanonicalResponseChunk, ResponseNode, StopReason, TokenUsageNode, ToolUseNode};
pub use tool::{dedupe_tool_definitions, ToolDef};
