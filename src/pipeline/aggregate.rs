//! Tool-call state machine: intermediate events -> canonical chunks.
//!
//! ```text
//! Streaming ──ToolCallStarted──▶ ToolUsePending ──all calls closed──▶ ToolUseComplete
//!     │                               ▲      │                              │
//!     │                               └──────┘ (parallel calls)             │
//!     └────────────────────StreamEnd / finish()─────────────────────────▶ Done
//! ```
//!
//! Calls are keyed by `tool_call_id` when the backend repeats it, else by `index`. A new
//! backend id on an index that is still open closes the previous call.
//! Exactly one terminal chunk is produced, carrying the merged usage node.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::normalize::schema::strip_optional_nulls;
use crate::pipeline::PipelineError;
use crate::transport::scrub;
use crate::types::{
    CanonicalResponseChunk, ResponseNode, StopReason, StreamingEvent, TokenUsageNode, ToolDef,
    ToolUseNode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Streaming,
    ToolUsePending,
    ToolUseComplete,
    Done,
}

#[derive(Debug, Clone)]
struct PendingCall {
    id: String,
    /// `id` came from the backend rather than being synthesized.
    backend_id: bool,
    index: Option<u32>,
    name: String,
    arguments: String,
    closed: bool,
}

#[derive(Debug, Clone)]
struct McpMeta {
    server: Option<String>,
    tool: Option<String>,
}

pub struct ChunkAggregator {
    state: TurnState,
    calls: Vec<PendingCall>,
    emitted_ids: HashSet<String>,
    emitted_tool_uses: usize,
    usage: Option<TokenUsageNode>,
    native_stop: Option<String>,
    mcp: HashMap<String, McpMeta>,
    schemas: HashMap<String, Value>,
    secrets: Vec<String>,
}

impl ChunkAggregator {
    /// `tools` supplies MCP metadata and the input schemas emitted arguments are
    /// reconciled with.
    pub fn new(tools: &[ToolDef]) -> Self {
        let mcp = tools
            .iter()
            .filter(|t| t.mcp_server_name.is_some() || t.mcp_tool_name.is_some())
            .map(|t| {
                (
                    t.name.clone(),
                    McpMeta {
                        server: t.mcp_server_name.clone(),
                        tool: t.mcp_tool_name.clone(),
                    },
                )
            })
            .collect();
        let schemas = tools
            .iter()
            .map(|t| (t.name.clone(), t.input_schema.clone()))
            .collect();
        Self {
            state: TurnState::Streaming,
            calls: Vec::new(),
            emitted_ids: HashSet::new(),
            emitted_tool_uses: 0,
            usage: None,
            native_stop: None,
            mcp,
            schemas,
            secrets: Vec::new(),
        }
    }

    /// Credentials scrubbed from in-band stream errors.
    pub fn with_secrets(mut self, secrets: Vec<String>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == TurnState::Done
    }

    /// Feed one event; returns the chunks it completes, in arrival order.
    pub fn push(&mut self, event: StreamingEvent) -> Result<Vec<CanonicalResponseChunk>, PipelineError> {
        if self.is_done() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        match event {
            StreamingEvent::PartialContentDelta { content } => {
                if !content.is_empty() {
                    out.push(CanonicalResponseChunk::text(content));
                }
            }
            StreamingEvent::ToolCallStarted {
                tool_call_id,
                tool_name,
                index,
            } => {
                let id = (!tool_call_id.trim().is_empty()).then_some(tool_call_id);
                let pos = self.locate(id.as_deref(), index, false);
                match pos {
                    Some(pos) if self.is_other_call(pos, id.as_deref()) => {
                        if let Some(node) = self.close(pos) {
                            out.push(CanonicalResponseChunk::node(node));
                        }
                        self.open(id, index, tool_name);
                    }
                    Some(pos) => {
                        let call = &mut self.calls[pos];
                        if call.name.is_empty() {
                            call.name = tool_name;
                        }
                        if let Some(id) = id {
                            call.id = id;
                            call.backend_id = true;
                        }
                    }
                    None => self.open(id, index, tool_name),
                }
                self.state = TurnState::ToolUsePending;
            }
            StreamingEvent::PartialToolCall {
                tool_call_id,
                arguments,
                index,
            } => {
                let pos = match self.locate(tool_call_id.as_deref(), index, true) {
                    Some(pos) => pos,
                    None => {
                        self.open(tool_call_id, index, String::new());
                        self.calls.len() - 1
                    }
                };
                self.calls[pos].arguments.push_str(&arguments);
                self.state = TurnState::ToolUsePending;
            }
            StreamingEvent::ToolCallEnded {
                tool_call_id,
                index,
                arguments,
            } => match self.locate(tool_call_id.as_deref(), index, true) {
                Some(pos) => {
                    if let Some(full) = arguments {
                        self.calls[pos].arguments = full;
                    }
                    if let Some(node) = self.close(pos) {
                        out.push(CanonicalResponseChunk::node(node));
                    }
                }
                None => {
                    tracing::warn!(
                        tool_call_id = ?tool_call_id,
                        index = ?index,
                        "Tool call end without a matching start; ignoring"
                    );
                }
            },
            StreamingEvent::Metadata { usage, stop_reason } => {
                if let Some(u) = usage {
                    self.usage.get_or_insert_with(TokenUsageNode::default).merge(&u);
                }
                if let Some(reason) = stop_reason {
                    self.native_stop = Some(reason);
                }
            }
            StreamingEvent::StreamEnd { finish_reason } => {
                if let Some(reason) = finish_reason {
                    self.native_stop = Some(reason);
                }
                out.extend(self.finish());
            }
            StreamingEvent::StreamError { error } => {
                return Err(PipelineError::Upstream(scrub(&upstream_message(&error), &self.secrets)));
            }
        }
        Ok(out)
    }

    /// Close every open call and emit the single terminal chunk. Returns nothing when
    /// the turn is already done.
    pub fn finish(&mut self) -> Vec<CanonicalResponseChunk> {
        if self.is_done() {
            return Vec::new();
        }
        let mut out = Vec::new();
        for pos in 0..self.calls.len() {
            if !self.calls[pos].closed {
                if let Some(node) = self.close(pos) {
                    out.push(CanonicalResponseChunk::node(node));
                }
            }
        }

        let mut stop = self
            .native_stop
            .as_deref()
            .map(StopReason::from_native)
            .unwrap_or(StopReason::EndTurn);
        if self.emitted_tool_uses > 0 && matches!(stop, StopReason::EndTurn | StopReason::Other) {
            stop = StopReason::ToolUseRequested;
        }
        let nodes = self
            .usage
            .take()
            .map(|u| vec![ResponseNode::TokenUsage(u)])
            .unwrap_or_default();
        out.push(CanonicalResponseChunk::terminal(stop, nodes));
        self.state = TurnState::Done;
        out
    }

    fn locate(&self, id: Option<&str>, index: Option<u32>, fallback_last_open: bool) -> Option<usize> {
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            if let Some(pos) = self.calls.iter().position(|c| c.id == id) {
                return Some(pos);
            }
        }
        if let Some(index) = index {
            if let Some(pos) = self
                .calls
                .iter()
                .rposition(|c| c.index == Some(index) && !c.closed)
            {
                return Some(pos);
            }
            return None;
        }
        if fallback_last_open && id.map(str::is_empty).unwrap_or(true) {
            return self.calls.iter().rposition(|c| !c.closed);
        }
        None
    }

    /// An open call found by index that already carries a different backend id.
    fn is_other_call(&self, pos: usize, id: Option<&str>) -> bool {
        let call = &self.calls[pos];
        id.map_or(false, |id| call.backend_id && call.id != id)
    }

    fn open(&mut self, id: Option<String>, index: Option<u32>, name: String) {
        let id = id.filter(|s| !s.trim().is_empty());
        let backend_id = id.is_some();
        let id = id.unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
        self.calls.push(PendingCall {
            id,
            backend_id,
            index,
            name,
            arguments: String::new(),
            closed: false,
        });
    }

    fn close(&mut self, pos: usize) -> Option<ResponseNode> {
        let call = &mut self.calls[pos];
        if call.closed {
            return None;
        }
        call.closed = true;
        let all_closed = self.calls.iter().all(|c| c.closed);
        if all_closed {
            self.state = TurnState::ToolUseComplete;
        }

        let call = self.calls[pos].clone();
        if call.name.trim().is_empty() {
            tracing::warn!(tool_call_id = %call.id, "Dropping tool call without a name");
            return None;
        }
        let mut id = call.id;
        if !self.emitted_ids.insert(id.clone()) {
            // Backends occasionally reuse ids across parallel calls.
            id = format!("{}_{}", id, self.emitted_tool_uses);
            self.emitted_ids.insert(id.clone());
        }

        let input = normalize_arguments(&call.arguments, self.schemas.get(&call.name));
        let mut node = ToolUseNode::new(id, call.name.clone(), input);
        if let Some(meta) = self.mcp.get(&call.name) {
            node.mcp_server_name = meta.server.clone();
            node.mcp_tool_name = meta.tool.clone();
        }
        self.emitted_tool_uses += 1;
        Some(ResponseNode::ToolUse(node))
    }
}

/// Arguments are serialized objects; empty input becomes `{}`. With the tool's schema,
/// nulls for optional properties that never accept null are dropped (strict-mode
/// backends send them for every optional property).
fn normalize_arguments(raw: &str, schema: Option<&Value>) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "{}".to_string();
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(mut v) if v.is_object() => {
            if let Some(schema) = schema {
                strip_optional_nulls(schema, &mut v);
            }
            v.to_string()
        }
        Ok(serde_json::Value::Null) => "{}".to_string(),
        Ok(other) => serde_json::json!({ "value": other }).to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "Tool call arguments are not valid JSON; passing through");
            trimmed.to_string()
        }
    }
}

fn upstream_message(error: &serde_json::Value) -> String {
    error
        .get("message")
        .or_else(|| error.pointer("/error/message"))
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| error.to_string())
}
