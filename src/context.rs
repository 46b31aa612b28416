//! Shared bridge context: the last captured tool-definition set.
//!
//! The set is captured from live chat traffic (the client sends its full tool list with
//! every agentic request) and read by the self-test harness. Last write wins; readers
//! get an `Arc` snapshot and never block writers.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwapOption;
use serde::Serialize;

use crate::types::{dedupe_tool_definitions, ToolDef};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A de-duplicated tool-definition set and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedToolSet {
    pub tools: Vec<ToolDef>,
    pub captured_at_ms: u64,
    /// Endpoint or component the set was captured from.
    pub source: String,
}

impl CapturedToolSet {
    pub fn new(tools: &[ToolDef], source: impl Into<String>) -> Self {
        Self {
            tools: dedupe_tool_definitions(tools),
            captured_at_ms: now_ms(),
            source: source.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Explicit context passed to the router glue and the self-test harness.
#[derive(Debug, Default)]
pub struct BridgeContext {
    captured: ArcSwapOption<CapturedToolSet>,
}

impl BridgeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture `tools` unless the list is empty. Returns whether a set was stored.
    pub fn capture(&self, tools: &[ToolDef], source: &str) -> bool {
        if tools.is_empty() {
            return false;
        }
        let set = CapturedToolSet::new(tools, source);
        tracing::debug!(count = set.len(), source = %source, "Captured tool definitions");
        self.captured.store(Some(Arc::new(set)));
        true
    }

    /// Replace the stored set unconditionally (`None` clears it).
    pub fn replace(&self, set: Option<CapturedToolSet>) {
        self.captured.store(set.map(Arc::new));
    }

    pub fn get(&self) -> Option<Arc<CapturedToolSet>> {
        self.captured.load_full()
    }

    pub fn clear(&self) {
        self.captured.store(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> ToolDef {
        ToolDef::new(name, "", json!({"type": "object"}))
    }

    #[test]
    fn test_capture_lifecycle() {
        let ctx = BridgeContext::new();
        assert!(ctx.get().is_none());
        assert!(!ctx.capture(&[], "/chat-stream"));
        assert!(ctx.capture(&[tool("a"), tool("a"), tool("b")], "/chat-stream"));
        let set = ctx.get().unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.source, "/chat-stream");

        ctx.capture(&[tool("c")], "/chat");
        assert_eq!(ctx.get().unwrap().tools[0].name, "c");

        ctx.replace(Some(CapturedToolSet::new(&[tool("d")], "test")));
        assert_eq!(ctx.get().unwrap().tools[0].name, "d");
        ctx.clear();
        assert!(ctx.get().is_none());
    }
}
