//! Host tool-execution capability.
//!
//! The host editor owns the real tools (file edits, terminals, diagnostics, retrieval,
//! web access, task lists). It hands the bridge an implementation of [`ToolHost`] at
//! startup; the self-test harness uses it to list the live tool set and to execute
//! tools against a scratch directory.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::types::ToolDef;
use crate::Result;

/// Result of one tool execution as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Per-call context handed to the host.
#[derive(Debug, Clone)]
pub struct ToolCallContext {
    pub conversation_id: String,
    pub tool_use_id: String,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl ToolCallContext {
    pub fn new(tool_use_id: impl Into<String>, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            conversation_id: String::new(),
            tool_use_id: tool_use_id.into(),
            timeout,
            cancel,
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = conversation_id.into();
        self
    }
}

/// Capability interface implemented by the host.
#[async_trait]
pub trait ToolHost: Send + Sync {
    /// The tool definitions the host would expose to the model.
    async fn get_tool_definitions(&self) -> Result<Vec<ToolDef>>;

    /// Execute `name` with `input`. A tool that ran and failed is `Ok` with
    /// `is_error: true`; `Err` means the host could not run it at all.
    async fn call_tool(&self, name: &str, input: Value, ctx: &ToolCallContext) -> Result<ToolOutcome>;

    /// Workspace root used to place the scratch directory, when the host has one.
    fn workspace_root(&self) -> Option<PathBuf> {
        None
    }
}
