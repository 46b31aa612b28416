//! Tool definitions exposed to the model by the agent client.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Tool definition in canonical form.
///
/// `input_schema` is a JSON-Schema-like tree and may contain `$defs`, `oneOf`, `anyOf`
/// and `allOf`; the per-backend converters in [`crate::normalize::tools`] rewrite it into
/// each dialect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_tool_name: Option<String>,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            mcp_server_name: None,
            mcp_tool_name: None,
        }
    }

    pub fn with_mcp(mut self, server: impl Into<String>, tool: impl Into<String>) -> Self {
        self.mcp_server_name = Some(server.into());
        self.mcp_tool_name = Some(tool.into());
        self
    }
}

/// Drop tools whose name was already seen. The first occurrence wins; empty names are dropped.
pub fn dedupe_tool_definitions(tools: &[ToolDef]) -> Vec<ToolDef> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut out = Vec::with_capacity(tools.len());
    for tool in tools {
        let name = tool.name.trim();
        if name.is_empty() || !seen.insert(name) {
            continue;
        }
        out.push(tool.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dedupe_keeps_first_occurrence() {
        let tools = vec![
            ToolDef::new("x", "first", json!({"type": "object"})),
            ToolDef::new("y", "other", json!({"type": "object"})),
            ToolDef::new("x", "second", json!({"type": "object"})),
        ];
        let out = dedupe_tool_definitions(&tools);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].name, "x");
        assert_eq!(out[0].description, "first");
        assert_eq!(out[1].name, "y");
    }

    #[test]
    fn test_dedupe_drops_unnamed() {
        let tools = vec![ToolDef::new("  ", "blank", json!({}))];
        assert!(dedupe_tool_definitions(&tools).is_empty());
    }
}
