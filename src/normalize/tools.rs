//! Tool-definition converters, one per backend dialect.
//!
//! Every converter de-duplicates by name first (first occurrence wins).

use serde_json::{json, Value};

use super::schema::{clean_gemini_schema, coerce_strict_schema};
use crate::types::{dedupe_tool_definitions, ToolDef};

fn parameters(tool: &ToolDef) -> Value {
    match &tool.input_schema {
        Value::Object(m) if !m.is_empty() => tool.input_schema.clone(),
        _ => json!({"type": "object", "properties": {}}),
    }
}

/// `{type:"function", function:{name, description, parameters}}`
pub fn openai_chat_tools(tools: &[ToolDef]) -> Vec<Value> {
    dedupe_tool_definitions(tools)
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": parameters(t),
                }
            })
        })
        .collect()
}

/// Responses dialect: flat function tools with strict-mode schemas.
pub fn openai_responses_tools(tools: &[ToolDef]) -> Vec<Value> {
    dedupe_tool_definitions(tools)
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "name": t.name,
                "description": t.description,
                "parameters": coerce_strict_schema(&parameters(t)),
                "strict": true,
            })
        })
        .collect()
}

/// `{name, description, input_schema}`
pub fn anthropic_tools(tools: &[ToolDef]) -> Vec<Value> {
    dedupe_tool_definitions(tools)
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": parameters(t),
            })
        })
        .collect()
}

/// A single tool group holding every function declaration. Empty input yields no group.
pub fn gemini_tools(tools: &[ToolDef]) -> Vec<Value> {
    let declarations: Vec<Value> = dedupe_tool_definitions(tools)
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "parameters": clean_gemini_schema(&parameters(t)),
            })
        })
        .collect();
    if declarations.is_empty() {
        Vec::new()
    } else {
        vec![json!({ "functionDeclarations": declarations })]
    }
}

/// Name of a converted tool in any dialect.
pub fn converted_tool_name(tool: &Value) -> Option<&str> {
    tool.get("name")
        .or_else(|| tool.pointer("/function/name"))
        .and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::schema::validate_strict_schema;

    fn tools() -> Vec<ToolDef> {
        vec![
            ToolDef::new(
                "view",
                "View a file",
                json!({"type": "object", "properties": {"path": {"type": "string"}, "range": {"type": "array", "items": {"type": "integer"}}}, "required": ["path"]}),
            ),
            ToolDef::new("view", "duplicate", json!({"type": "object"})),
            ToolDef::new("noop", "", Value::Null),
        ]
    }

    #[test]
    fn test_openai_chat_shape_and_dedupe() {
        let out = openai_chat_tools(&tools());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["type"], "function");
        assert_eq!(out[0]["function"]["description"], "View a file");
        assert_eq!(out[1]["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn test_responses_tools_are_strict() {
        for tool in openai_responses_tools(&tools()) {
            assert_eq!(tool["strict"], true);
            assert!(validate_strict_schema(&tool["parameters"]).is_empty());
        }
    }

    #[test]
    fn test_anthropic_and_gemini_shapes() {
        let a = anthropic_tools(&tools());
        assert_eq!(a[0]["input_schema"]["required"], json!(["path"]));
        let g = gemini_tools(&tools());
        assert_eq!(g.len(), 1);
        assert_eq!(g[0]["functionDeclarations"].as_array().unwrap().len(), 2);
        assert!(gemini_tools(&[]).is_empty());
        assert_eq!(converted_tool_name(&a[1]), Some("noop"));
        assert_eq!(converted_tool_name(&openai_chat_tools(&tools())[0]), Some("view"));
    }
}
