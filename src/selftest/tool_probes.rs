//! Real tool-set probes: acquisition, schema checks, and model round trips in batches.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::context::BridgeContext;
use crate::host::ToolHost;
use crate::normalize::tools::converted_tool_name;
use crate::normalize::{
    anthropic_tools, check_sample, gemini_tools, openai_chat_tools, openai_responses_tools, validate_strict_schema,
};
use crate::pipeline::CallGuard;
use crate::types::{dedupe_tool_definitions, CanonicalChatRequest, RequestNode, ToolDef, ToolResultNode, ToolUseNode};
use crate::{Error, Result};

use super::fixtures::{batch_prompt, synthesized_result, tool_result_followup};
use super::probes::{preview, result_nodes, ProviderProbe};
use super::report::{RunLog, TestResult};

/// Tools asked for in a single model turn.
pub const ROUND_TRIP_BATCH_SIZE: usize = 6;

/// Every tool use must be answered by exactly one result, and every result must answer
/// a tool use. The error names the first tool that breaks the pairing.
pub fn check_round_trip_pairing(uses: &[ToolUseNode], results: &[ToolResultNode]) -> Result<()> {
    let mut ids = HashSet::new();
    for tool_use in uses {
        if !ids.insert(tool_use.tool_use_id.as_str()) {
            return Err(Error::ToolRoundTrip {
                tool: tool_use.tool_name.clone(),
                reason: format!("tool_use_id {} is used twice in one response", tool_use.tool_use_id),
            });
        }
        match results.iter().filter(|r| r.tool_use_id == tool_use.tool_use_id).count() {
            1 => {}
            0 => {
                return Err(Error::ToolRoundTrip {
                    tool: tool_use.tool_name.clone(),
                    reason: format!("no tool result answers tool_use_id {}", tool_use.tool_use_id),
                })
            }
            n => {
                return Err(Error::ToolRoundTrip {
                    tool: tool_use.tool_name.clone(),
                    reason: format!("tool_use_id {} is answered {} times", tool_use.tool_use_id, n),
                })
            }
        }
    }
    if let Some(orphan) = results.iter().find(|r| !ids.contains(r.tool_use_id.as_str())) {
        return Err(Error::ToolRoundTrip {
            tool: "(unknown)".into(),
            reason: format!("tool result {} answers no tool use", orphan.tool_use_id),
        });
    }
    Ok(())
}

/// Captured set first, then the host. `Ok` with an empty list when neither is available.
pub(crate) async fn fetch_tools(
    context: &BridgeContext,
    host: Option<&Arc<dyn ToolHost>>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(Vec<ToolDef>, String)> {
    if let Some(set) = context.get() {
        let tools = dedupe_tool_definitions(&set.tools);
        let detail = format!("{} tools captured from {}", tools.len(), set.source);
        return Ok((tools, detail));
    }
    let Some(host) = host else {
        return Ok((Vec::new(), "skipped: no captured tool set and no tool host".into()));
    };
    let guard = CallGuard::new("get_tool_definitions", timeout, cancel.clone());
    let tools = dedupe_tool_definitions(&guard.run(host.get_tool_definitions()).await?);
    let detail = format!("{} tools from the tool host", tools.len());
    Ok((tools, detail))
}

/// One failed result per failing tool, then the summary. A passing check may return a
/// note, which lands in the summary detail.
fn per_tool<F>(log: &RunLog, summary: &str, tools: &[ToolDef], check: F) -> Vec<TestResult>
where
    F: Fn(&ToolDef) -> Result<Option<String>>,
{
    let started = Instant::now();
    let mut out = Vec::new();
    let mut notes = Vec::new();
    for tool in tools {
        let t0 = Instant::now();
        match check(tool) {
            Ok(Some(note)) => notes.push(format!("{}: {}", tool.name, note)),
            Ok(None) => {}
            Err(e) => out.push(log.record(&format!("{}:{}", summary, tool.name), t0, Err(e))),
        }
    }
    let failed = out.len();
    let outcome = if failed == 0 && notes.is_empty() {
        Ok(format!("{} tools", tools.len()))
    } else if failed == 0 {
        Ok(format!("{} tools; {}", tools.len(), notes.join("; ")))
    } else {
        Err(Error::validation(format!("{} of {} tools failed", failed, tools.len())))
    };
    out.push(log.record(summary, started, outcome));
    out
}

/// Every schema must sample into a value it accepts. Patterns the sampler cannot
/// satisfy are noted, not failed.
pub(crate) fn schema_sample_checks(log: &RunLog, tools: &[ToolDef]) -> Vec<TestResult> {
    per_tool(log, "schema-sample", tools, |tool| {
        let checked = check_sample(&tool.input_schema).map_err(|issues| Error::SchemaViolation {
            tool: tool.name.clone(),
            issues,
        })?;
        Ok((!checked.notes.is_empty()).then(|| checked.notes.join(", ")))
    })
}

/// Every dialect keeps every tool by name; responses-dialect schemas pass strict validation.
pub(crate) fn schema_dialect_checks(log: &RunLog, tools: &[ToolDef]) -> Vec<TestResult> {
    let started = Instant::now();
    let dialects = [
        ("openai_chat", openai_chat_tools(tools)),
        ("openai_responses", openai_responses_tools(tools)),
        ("anthropic", anthropic_tools(tools)),
    ];
    let mut problems = Vec::new();
    for (dialect, converted) in &dialects {
        let names: Vec<&str> = converted.iter().filter_map(converted_tool_name).collect();
        if names.len() != tools.len() {
            problems.push(format!("{}: {} of {} tools converted", dialect, names.len(), tools.len()));
        }
    }
    let gemini_count = gemini_tools(tools)
        .first()
        .and_then(|group| group.get("functionDeclarations"))
        .and_then(|d| d.as_array())
        .map_or(0, |d| d.len());
    if gemini_count != tools.len() {
        problems.push(format!("gemini: {} of {} tools converted", gemini_count, tools.len()));
    }
    let outcome = if problems.is_empty() {
        Ok(format!("{} tools in 4 dialects", tools.len()))
    } else {
        Err(Error::validation(problems.join("; ")))
    };
    let mut out = vec![log.record("schema-dialects", started, outcome)];

    let responses = openai_responses_tools(tools);
    out.extend(per_tool(log, "schema-strict", tools, |tool| {
        let parameters = responses
            .iter()
            .find(|t| converted_tool_name(t) == Some(tool.name.as_str()))
            .and_then(|t| t.get("parameters"))
            .ok_or_else(|| Error::SchemaViolation {
                tool: tool.name.clone(),
                issues: vec!["missing from the responses dialect".into()],
            })?;
        let issues = validate_strict_schema(parameters);
        if issues.is_empty() {
            Ok(None)
        } else {
            Err(Error::SchemaViolation {
                tool: tool.name.clone(),
                issues: issues.iter().map(ToString::to_string).collect(),
            })
        }
    }));
    out
}

/// The backend accepts the whole real tool set in one request.
pub(crate) async fn real_tool_schema(probe: &ProviderProbe, tools: &[ToolDef]) -> Result<String> {
    let mut request = CanonicalChatRequest::from_message("Reply with OK. Do not call any tool.");
    request.tool_definitions = tools.to_vec();
    let turn = probe.chat(request).await?;
    Ok(format!(
        "{} tools accepted, stop={}",
        tools.len(),
        turn.stop_reason.map_or("none", |s| s.as_str())
    ))
}

/// Ask for every tool of a batch in one turn, answer with synthesized results, and
/// record one result per tool. A failing tool never aborts the rest of the batch.
pub(crate) async fn real_tool_round_trip(
    log: &RunLog,
    probe: &ProviderProbe,
    batch: &[ToolDef],
    batch_index: usize,
) -> Vec<TestResult> {
    let started = Instant::now();
    log.line(format!(
        "round-trip batch {}: {}",
        batch_index + 1,
        batch.iter().map(|t| t.name.as_str()).collect::<Vec<_>>().join(", ")
    ));
    let name = |tool: &ToolDef| format!("real-tool-round-trip:{}", tool.name);

    let mut request = CanonicalChatRequest::from_message(batch_prompt(batch));
    request.tool_definitions = batch.to_vec();
    let turn = match probe.chat(request.clone()).await {
        Ok(turn) => turn,
        Err(e) => {
            let detail = e.to_string();
            return batch
                .iter()
                .map(|tool| log.record(&name(tool), started, Err(Error::runtime(detail.clone()))))
                .collect();
        }
    };

    // Every use is answered, even repeats and unknown names; backends reject dangling calls.
    let uses: Vec<ToolUseNode> = turn.tool_uses().into_iter().cloned().collect();
    let results: Vec<RequestNode> = uses
        .iter()
        .map(|u| RequestNode::tool_result(u.tool_use_id.clone(), synthesized_result(u)))
        .collect();
    let followup_outcome = match check_round_trip_pairing(&uses, &result_nodes(&results)) {
        Ok(()) if uses.is_empty() => Ok(()),
        Ok(()) => {
            let followup = tool_result_followup(&request, &turn.text, &uses, results);
            probe.chat(followup).await.map(|_| ())
        }
        Err(e) => Err(e),
    };

    batch
        .iter()
        .map(|tool| {
            let outcome = match uses.iter().find(|u| u.tool_name == tool.name) {
                None => Err(Error::ToolRoundTrip {
                    tool: tool.name.clone(),
                    reason: "model did not call the tool".into(),
                }),
                Some(call) => match &followup_outcome {
                    Err(e) => Err(Error::ToolRoundTrip {
                        tool: tool.name.clone(),
                        reason: format!("tool result not accepted: {}", e),
                    }),
                    Ok(()) => {
                        let mut detail = format!("args {}", preview(&call.input_json));
                        if let Some(note) = mcp_mismatch(tool, call) {
                            detail.push_str(&format!("; mcp mismatch (non-fatal): {}", note));
                        }
                        Ok(detail)
                    }
                },
            };
            log.record(&name(tool), started, outcome)
        })
        .collect()
}

/// Provider-attached MCP metadata that differs from the tool definition.
fn mcp_mismatch(tool: &ToolDef, call: &ToolUseNode) -> Option<String> {
    let mut notes = Vec::new();
    if tool.mcp_server_name.is_some() && call.mcp_server_name != tool.mcp_server_name {
        notes.push(format!(
            "server {:?} != {:?}",
            call.mcp_server_name.as_deref().unwrap_or(""),
            tool.mcp_server_name.as_deref().unwrap_or("")
        ));
    }
    if tool.mcp_tool_name.is_some() && call.mcp_tool_name != tool.mcp_tool_name {
        notes.push(format!(
            "tool {:?} != {:?}",
            call.mcp_tool_name.as_deref().unwrap_or(""),
            tool.mcp_tool_name.as_deref().unwrap_or("")
        ));
    }
    if notes.is_empty() {
        None
    } else {
        Some(notes.join(", "))
    }
}
