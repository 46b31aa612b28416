//! Real tool execution through the host, against a scratch directory.
//!
//! The sequence mirrors what an agent does in a session: write, read, edit and delete a
//! file; drive a terminal; ask for diagnostics, retrieval and web access; create and
//! update a task. Tools the host does not expose are skipped, not failed. The scratch
//! directory is removed at the end whatever happened.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::host::{ToolCallContext, ToolHost};
use crate::pipeline::CallGuard;
use crate::types::ToolDef;
use crate::{Error, Result};

use super::probes::preview;
use super::report::{RunLog, TestResult};

const SCRATCH_DIR: &str = ".byok-selftest";
const FIRST_MARKER: &str = "byok-selftest-alpha";
const SECOND_MARKER: &str = "byok-selftest-beta";

static TERMINAL_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)terminal[\s_-]*(?:id)?\D{0,8}?(\d+)").unwrap());
static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}").unwrap()
});
static TASK_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)task[\s_-]*id\W{0,4}([A-Za-z0-9_-]{4,})").unwrap());

/// Scratch directory: `root` on disk, `tool_path` as handed to tools.
#[derive(Debug, Clone)]
struct Scratch {
    root: PathBuf,
    tool_path: String,
}

impl Scratch {
    fn new(workspace: Option<PathBuf>, run_id: &str) -> Self {
        let relative = format!("{}/{}", SCRATCH_DIR, run_id);
        match workspace {
            // Workspace tools take workspace-relative paths.
            Some(ws) => Self {
                root: ws.join(&relative),
                tool_path: relative,
            },
            None => {
                let root = std::env::temp_dir().join(&relative);
                let tool_path = root.to_string_lossy().into_owned();
                Self { root, tool_path }
            }
        }
    }

    fn file(&self, name: &str) -> String {
        format!("{}/{}", self.tool_path, name)
    }

    async fn cleanup(&self) {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.root.display(), error = %e, "Scratch cleanup failed"),
        }
        // Only succeeds once empty; a concurrent run keeps it.
        if let Some(parent) = self.root.parent() {
            if tokio::fs::remove_dir(parent).await.is_ok() {
                tracing::debug!(path = %parent.display(), "Removed empty scratch parent");
            }
        }
    }
}

/// Id from a tool's output: JSON keys first, then the regex.
fn extract_id(content: &str, keys: &[&str], re: &Regex) -> Option<String> {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(content) {
        for key in keys {
            match obj.get(*key) {
                Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
                Some(Value::Number(n)) => return Some(n.to_string()),
                _ => {}
            }
        }
    }
    re.captures(content)
        .and_then(|c| c.get(1).or_else(|| c.get(0)))
        .map(|m| m.as_str().to_string())
}

fn terminal_id(content: &str) -> Option<String> {
    extract_id(content, &["terminal_id", "terminalId"], &TERMINAL_ID_RE)
}

fn task_id(content: &str) -> Option<String> {
    extract_id(content, &["task_id", "taskId", "id"], &UUID_RE).or_else(|| {
        TASK_ID_RE
            .captures(content)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    })
}

struct Executor<'a> {
    host: &'a Arc<dyn ToolHost>,
    available: HashSet<String>,
    cancel: CancellationToken,
    log: &'a RunLog,
    calls: usize,
}

enum Step {
    Ran(String),
    Skipped,
}

impl Executor<'_> {
    /// Host tool name for `name`, accepting `-`/`_` spelling variants.
    fn resolve(&self, name: &str) -> Option<String> {
        [name.to_string(), name.replace('-', "_"), name.replace('_', "-")]
            .into_iter()
            .find(|candidate| self.available.contains(candidate))
    }

    async fn call(&mut self, name: &str, input: Value) -> Result<Step> {
        let Some(tool) = self.resolve(name) else {
            return Ok(Step::Skipped);
        };
        self.calls += 1;
        let ctx = ToolCallContext::new(
            format!("selftest-exec-{}", self.calls),
            super::TOOL_CALL_TIMEOUT,
            self.cancel.clone(),
        )
        .with_conversation("byok-selftest");
        let guard = CallGuard::new(format!("tool {}", tool), ctx.timeout, self.cancel.clone());
        let outcome = guard.run(self.host.call_tool(&tool, input, &ctx)).await?;
        if outcome.is_error {
            return Err(Error::runtime(format!("{} reported an error: {}", tool, preview(&outcome.content))));
        }
        Ok(Step::Ran(outcome.content))
    }

    /// Run one step and record it. `check` turns the tool output into a detail line.
    async fn step<F>(&mut self, test: &str, tool: &str, input: Value, check: F) -> (TestResult, Option<String>)
    where
        F: FnOnce(&str) -> Result<String>,
    {
        let started = Instant::now();
        let (outcome, content) = match self.call(tool, input).await {
            Ok(Step::Skipped) => (Ok(format!("skipped: host has no `{}` tool", tool)), None),
            Ok(Step::Ran(content)) => (check(&content), Some(content)),
            Err(e) => (Err(e), None),
        };
        (self.log.record(test, started, outcome), content)
    }

    fn missing(&self, test: &str, what: &str) -> TestResult {
        self.log
            .record(test, Instant::now(), Err(Error::runtime(format!("no {} from the previous step", what))))
    }
}

fn expect_contains(content: &str, needle: &str) -> Result<String> {
    if content.contains(needle) {
        Ok(format!("found {}", needle))
    } else {
        Err(Error::runtime(format!("expected {} in output: {}", needle, preview(content))))
    }
}

fn summary(content: &str) -> Result<String> {
    Ok(preview(content))
}

/// Execute the host's tools against a scratch directory. Returns one result per step.
pub(crate) async fn run_real_tool_execution(
    log: &RunLog,
    host: &Arc<dyn ToolHost>,
    tools: &[ToolDef],
    run_id: &str,
    cancel: &CancellationToken,
) -> Vec<TestResult> {
    let scratch = Scratch::new(host.workspace_root(), run_id);
    log.line(format!("real-tool execution in {}", scratch.root.display()));
    if let Err(e) = tokio::fs::create_dir_all(&scratch.root).await {
        let result = log.record("exec:scratch", Instant::now(), Err(Error::from(e)));
        scratch.cleanup().await;
        return vec![result];
    }

    let mut exec = Executor {
        host,
        available: tools.iter().map(|t| t.name.clone()).collect(),
        cancel: cancel.clone(),
        log,
        calls: 0,
    };
    let results = exec_sequence(&mut exec, &scratch).await;
    scratch.cleanup().await;
    results
}

async fn exec_sequence(exec: &mut Executor<'_>, scratch: &Scratch) -> Vec<TestResult> {
    let mut results = Vec::new();
    let file = scratch.file("probe.txt");

    // File lifecycle.
    let (r, _) = exec
        .step(
            "exec:save-file",
            "save-file",
            json!({"path": file, "file_content": format!("{}\n", FIRST_MARKER), "add_last_line_newline": true}),
            |_| Ok(format!("wrote {}", file)),
        )
        .await;
    results.push(r);
    let (r, _) = exec
        .step("exec:view", "view", json!({"path": file, "type": "file"}), |c| {
            expect_contains(c, FIRST_MARKER)
        })
        .await;
    results.push(r);
    let (r, _) = exec
        .step(
            "exec:str-replace-editor",
            "str-replace-editor",
            json!({
                "command": "str_replace",
                "path": file,
                "old_str_1": FIRST_MARKER,
                "new_str_1": SECOND_MARKER,
                "old_str_start_line_number_1": 1,
                "old_str_end_line_number_1": 1
            }),
            summary,
        )
        .await;
    results.push(r);
    let (r, _) = exec
        .step("exec:view-after-edit", "view", json!({"path": file, "type": "file"}), |c| {
            expect_contains(c, SECOND_MARKER)
        })
        .await;
    results.push(r);
    let (r, _) = exec
        .step("exec:diagnostics", "diagnostics", json!({"paths": [file]}), summary)
        .await;
    results.push(r);

    // Terminal.
    let (r, launched) = exec
        .step(
            "exec:launch-process",
            "launch-process",
            json!({
                "command": "echo byok-selftest-terminal",
                "wait": false,
                "max_wait_seconds": 5,
                "cwd": scratch.root.to_string_lossy()
            }),
            |c| match terminal_id(c) {
                Some(id) => Ok(format!("terminal {}", id)),
                None => Err(Error::runtime(format!("no terminal id in output: {}", preview(c)))),
            },
        )
        .await;
    let launch_ok = r.ok;
    results.push(r);
    let terminal = launched.as_deref().and_then(terminal_id);
    match (&launched, terminal) {
        (Some(_), Some(id)) => {
            let id_num: Value = id.parse::<u64>().map(Value::from).unwrap_or_else(|_| Value::from(id.clone()));
            for (test, tool, input) in [
                (
                    "exec:read-process",
                    "read-process",
                    json!({"terminal_id": id_num, "wait": true, "max_wait_seconds": 5}),
                ),
                (
                    "exec:write-process",
                    "write-process",
                    json!({"terminal_id": id_num, "input_text": "echo byok-selftest-input\n"}),
                ),
                ("exec:kill-process", "kill-process", json!({"terminal_id": id_num})),
            ] {
                let (r, _) = exec.step(test, tool, input, summary).await;
                results.push(r);
            }
        }
        // Launch was skipped: nothing to drive.
        (None, _) if launch_ok => {}
        _ => {
            for test in ["exec:read-process", "exec:write-process", "exec:kill-process"] {
                results.push(exec.missing(test, "terminal id"));
            }
        }
    }

    // Retrieval and web access.
    for (test, tool, input) in [
        (
            "exec:codebase-retrieval",
            "codebase-retrieval",
            json!({"information_request": "Where is the entry point of this workspace?"}),
        ),
        (
            "exec:web-search",
            "web-search",
            json!({"query": "Rust programming language", "num_results": 1}),
        ),
        ("exec:web-fetch", "web-fetch", json!({"url": "https://example.com"})),
    ] {
        let (r, _) = exec.step(test, tool, input, summary).await;
        results.push(r);
    }

    // Task list CRUD.
    let (r, _) = exec.step("exec:view_tasklist", "view_tasklist", json!({}), summary).await;
    results.push(r);
    let (r, added) = exec
        .step(
            "exec:add_tasks",
            "add_tasks",
            json!({"tasks": [{"name": "byok self-test task", "description": "Created by the bridge self-test"}]}),
            |c| match task_id(c) {
                Some(id) => Ok(format!("task {}", id)),
                None => Err(Error::runtime(format!("no task id in output: {}", preview(c)))),
            },
        )
        .await;
    let add_ok = r.ok;
    results.push(r);
    match (&added, added.as_deref().and_then(task_id)) {
        (Some(_), Some(id)) => {
            for (test, state) in [("exec:update_tasks", "IN_PROGRESS"), ("exec:delete_task", "CANCELLED")] {
                let (r, _) = exec
                    .step(test, "update_tasks", json!({"tasks": [{"task_id": id, "state": state}]}), summary)
                    .await;
                results.push(r);
            }
        }
        (None, _) if add_ok => {}
        _ => {
            for test in ["exec:update_tasks", "exec:delete_task"] {
                results.push(exec.missing(test, "task id"));
            }
        }
    }

    let (r, _) = exec
        .step("exec:remove-files", "remove-files", json!({"file_paths": [file]}), summary)
        .await;
    results.push(r);
    results
}
