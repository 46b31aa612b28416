//! Full self-test run against a scripted OpenAI-compatible backend and an in-memory host.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use byok_bridge::config::{BridgeConfig, ProviderConfig, ProviderType};
use byok_bridge::context::BridgeContext;
use byok_bridge::host::{ToolCallContext, ToolHost, ToolOutcome};
use byok_bridge::normalize::sample_json_from_schema;
use byok_bridge::selftest::fixtures::synthetic_tool;
use byok_bridge::selftest::{SelfTest, SelfTestOptions};
use byok_bridge::ToolDef;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::mock_server::{MockServerFixture, SHORT, TEST_KEY};

const MODEL: &str = "scripted-model";

/// Answers like a cooperative model: calls every offered tool with schema-valid
/// arguments until it sees tool results, then replies with text.
struct ScriptedBackend {
    schemas: HashMap<String, Value>,
}

impl ScriptedBackend {
    fn chat_response(&self, body: &Value) -> (String, String) {
        let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let raw = body.to_string();
        if !stream {
            let text = if raw.contains("locate where the developer will edit next") {
                r#"[{"path":"src/stats.rs","line_start":1,"line_end":2,"reason":"rename"}]"#.to_string()
            } else {
                "pong".to_string()
            };
            let reply = json!({"choices": [{"message": {"role": "assistant", "content": text}, "finish_reason": "stop"}]});
            return ("application/json".into(), reply.to_string());
        }

        let tools: Vec<String> = body
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|t| t.pointer("/function/name").and_then(Value::as_str))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let after_results = body
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|m| m.last())
            .and_then(|m| m.get("role"))
            .and_then(Value::as_str)
            == Some("tool");

        let mut frames = Vec::new();
        if tools.is_empty() || after_results {
            frames.push(json!({"choices": [{"index": 0, "delta": {"content": "1 2 3 "}}]}));
            frames.push(json!({"choices": [{"index": 0, "delta": {"content": "hello"}}]}));
            frames.push(json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}));
        } else {
            for (i, name) in tools.iter().enumerate() {
                let args = self
                    .schemas
                    .get(name)
                    .map(sample_json_from_schema)
                    .unwrap_or_else(|| json!({}));
                frames.push(json!({"choices": [{"index": 0, "delta": {"tool_calls": [{
                    "index": i,
                    "id": format!("call_{}", i),
                    "type": "function",
                    "function": {"name": name, "arguments": args.to_string()}
                }]}}]}));
            }
            frames.push(json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}));
        }
        frames.push(json!({"choices": [], "usage": {"prompt_tokens": 10, "completion_tokens": 5}}));

        let mut sse: String = frames.iter().map(|f| format!("data: {}\n\n", f)).collect();
        sse.push_str("data: [DONE]\n\n");
        ("text/event-stream".into(), sse)
    }

    fn respond(&self, method: &str, path: &str, body: &[u8]) -> (u16, String, String) {
        match (method, path.split('?').next().unwrap_or("")) {
            ("GET", "/models") => (
                200,
                "application/json".into(),
                json!({"data": [{"id": MODEL}]}).to_string(),
            ),
            ("POST", "/chat/completions") => {
                let body: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
                let (content_type, payload) = self.chat_response(&body);
                (200, content_type, payload)
            }
            _ => (404, "application/json".into(), r#"{"error":"not found"}"#.into()),
        }
    }
}

fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

async fn serve_connection(mut socket: TcpStream, backend: Arc<ScriptedBackend>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let head_len = loop {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
        if let Some(end) = header_end(&buf) {
            break end;
        }
    };
    let head = String::from_utf8_lossy(&buf[..head_len]).to_string();
    let mut lines = head.lines();
    let request_line: Vec<&str> = lines.next().unwrap_or("").split_whitespace().collect();
    let (method, path) = (request_line.first().copied().unwrap_or(""), request_line.get(1).copied().unwrap_or(""));
    let content_length = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < head_len + content_length {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    let body = &buf[head_len..buf.len().min(head_len + content_length)];

    let (status, content_type, payload) = backend.respond(method, path, body);
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        if status == 200 { "OK" } else { "Not Found" },
        content_type,
        payload.len(),
        payload
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

async fn start_backend(backend: ScriptedBackend) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let backend = Arc::new(backend);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve_connection(socket, backend.clone()));
        }
    });
    format!("http://{}", addr)
}

/// In-memory host: files, one terminal and a task list.
#[derive(Default)]
struct MemoryHost {
    files: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<String>>,
}

fn tool(name: &str, properties: Value, required: &[&str]) -> ToolDef {
    ToolDef::new(
        name,
        format!("{} tool", name),
        json!({"type": "object", "properties": properties, "required": required}),
    )
}

fn host_tools() -> Vec<ToolDef> {
    vec![
        tool(
            "save-file",
            json!({"path": {"type": "string"}, "file_content": {"type": "string"}, "add_last_line_newline": {"type": "boolean"}}),
            &["path", "file_content"],
        ),
        tool("view", json!({"path": {"type": "string"}, "type": {"type": "string", "enum": ["file", "directory"]}}), &["path"]),
        tool(
            "str-replace-editor",
            json!({
                "command": {"type": "string", "enum": ["str_replace", "insert"]},
                "path": {"type": "string"},
                "old_str_1": {"type": "string"},
                "new_str_1": {"type": "string"}
            }),
            &["command", "path"],
        ),
        tool(
            "launch-process",
            json!({"command": {"type": "string"}, "wait": {"type": "boolean"}, "max_wait_seconds": {"type": "integer"}}),
            &["command", "wait"],
        ),
        tool("read-process", json!({"terminal_id": {"type": "integer"}, "wait": {"type": "boolean"}}), &["terminal_id"]),
        tool("kill-process", json!({"terminal_id": {"type": "integer"}}), &["terminal_id"]),
        tool(
            "add_tasks",
            json!({"tasks": {"type": "array", "items": {
                "type": "object",
                "properties": {"name": {"type": "string"}, "description": {"type": "string"}},
                "required": ["name"]
            }}}),
            &["tasks"],
        ),
        tool(
            "update_tasks",
            json!({"tasks": {"type": "array", "items": {
                "type": "object",
                "properties": {"task_id": {"type": "string"}, "state": {"type": "string", "enum": ["NOT_STARTED", "IN_PROGRESS", "CANCELLED", "COMPLETE"]}},
                "required": ["task_id"]
            }}}),
            &["tasks"],
        ),
        tool("remove-files", json!({"file_paths": {"type": "array", "items": {"type": "string"}}}), &["file_paths"]),
    ]
}

#[async_trait]
impl ToolHost for MemoryHost {
    async fn get_tool_definitions(&self) -> byok_bridge::Result<Vec<ToolDef>> {
        Ok(host_tools())
    }

    async fn call_tool(&self, name: &str, input: Value, _ctx: &ToolCallContext) -> byok_bridge::Result<ToolOutcome> {
        self.calls.lock().unwrap().push(name.to_string());
        let path = input.get("path").and_then(Value::as_str).unwrap_or("").to_string();
        let mut files = self.files.lock().unwrap();
        let outcome = match name {
            "save-file" => {
                let content = input.get("file_content").and_then(Value::as_str).unwrap_or("");
                files.insert(path, content.to_string());
                ToolOutcome::ok("File saved")
            }
            "view" => match files.get(&path) {
                Some(content) => ToolOutcome::ok(format!("     1\t{}", content)),
                None => ToolOutcome::error("no such file"),
            },
            "str-replace-editor" => {
                let old = input.get("old_str_1").and_then(Value::as_str).unwrap_or("");
                let new = input.get("new_str_1").and_then(Value::as_str).unwrap_or("");
                match files.get_mut(&path) {
                    Some(content) if content.contains(old) => {
                        *content = content.replace(old, new);
                        ToolOutcome::ok("Replaced 1 occurrence")
                    }
                    _ => ToolOutcome::error("old_str_1 not found"),
                }
            }
            "launch-process" => ToolOutcome::ok("Process launched with terminal ID 3"),
            "read-process" => ToolOutcome::ok("byok-selftest-terminal"),
            "kill-process" => ToolOutcome::ok("Terminal 3 killed"),
            "add_tasks" => ToolOutcome::ok(r#"{"created":[{"task_id":"8d3c5a4e-2b1f-4c6a-9e7d-0a1b2c3d4e5f"}]}"#),
            "update_tasks" => ToolOutcome::ok("Task updated"),
            "remove-files" => {
                for p in input
                    .get("file_paths")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_str)
                {
                    files.remove(p);
                }
                ToolOutcome::ok("Removed")
            }
            other => ToolOutcome::error(format!("unknown tool {}", other)),
        };
        Ok(outcome)
    }

    fn workspace_root(&self) -> Option<PathBuf> {
        Some(std::env::temp_dir())
    }
}

fn scripted_backend() -> ScriptedBackend {
    let mut schemas: HashMap<String, Value> = host_tools()
        .into_iter()
        .map(|t| (t.name, t.input_schema))
        .collect();
    let synthetic = synthetic_tool();
    schemas.insert(synthetic.name, synthetic.input_schema);
    ScriptedBackend { schemas }
}

fn config(base_url: &str) -> BridgeConfig {
    BridgeConfig {
        enabled: true,
        providers: vec![ProviderConfig::new("scripted", ProviderType::OpenAiCompatible, base_url).with_api_key(TEST_KEY)],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_full_run_against_cooperative_backend() {
    let base_url = start_backend(scripted_backend()).await;
    let host = Arc::new(MemoryHost::default());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let report = SelfTest::new(MockServerFixture::transport(), Arc::new(BridgeContext::new()))
        .with_host(host.clone())
        .with_options(SelfTestOptions::default().with_probe_timeout(SHORT).with_log(tx))
        .run(&config(&base_url), CancellationToken::new())
        .await;

    let failed: Vec<String> = report
        .failed_tests()
        .iter()
        .map(|(provider, t)| format!("{}:{} {}", provider, t.name, t.detail))
        .collect();
    assert!(report.ok, "failed tests: {:#?}", failed);
    assert_eq!(report.global.captured_tools, host_tools().len());
    assert_eq!(report.global.tests[0].name, "tool-source");

    let global: Vec<&str> = report.global.tests.iter().map(|t| t.name.as_str()).collect();
    for step in ["exec:save-file", "exec:view-after-edit", "exec:kill-process", "exec:delete_task", "exec:remove-files"] {
        assert!(global.contains(&step), "missing {} in {:?}", step, global);
    }
    assert!(host.files.lock().unwrap().is_empty());

    let entry = &report.providers[0];
    assert_eq!(entry.model, MODEL);
    let names: Vec<&str> = entry.tests.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(
        &names[..8],
        &[
            "config-check",
            "model-discovery",
            "complete-text",
            "stream-text",
            "next-edit",
            "next-edit-location",
            "chat-stream",
            "real-tool-schema"
        ]
    );
    let round_trips = names.iter().filter(|n| n.starts_with("real-tool-round-trip:")).count();
    assert_eq!(round_trips, host_tools().len());
    assert_eq!(&names[names.len() - 2..], &["synthetic-tool-multimodal", "tool-result-round-trip"]);

    let serialized = serde_json::to_string(&report).unwrap();
    assert!(!serialized.contains(TEST_KEY));

    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(line);
    }
    assert!(lines.iter().any(|l| l.contains("round-trip batch 2")));
    assert!(lines.last().unwrap().contains("finished: ok"));
}

#[tokio::test]
async fn test_unreachable_backend_fails_without_aborting() {
    let report = SelfTest::new(MockServerFixture::transport(), Arc::new(BridgeContext::new()))
        .with_options(SelfTestOptions::default().with_probe_timeout(SHORT))
        .run(
            &{
                let mut config = config("http://127.0.0.1:9");
                config.providers[0].default_model = Some("static-model".into());
                config
            },
            CancellationToken::new(),
        )
        .await;

    assert!(!report.ok);
    let entry = &report.providers[0];
    assert_eq!(entry.model, "static-model");
    assert!(entry.tests[0].ok, "config-check should pass");
    assert!(!entry.tests[1].ok, "model-discovery should fail");
    // Every later probe still ran and was recorded.
    let names: Vec<&str> = entry.tests.iter().map(|t| t.name.as_str()).collect();
    assert!(names.contains(&"chat-stream"));
    assert!(names.contains(&"tool-result-round-trip"));
    assert!(entry.tests.iter().skip(1).all(|t| !t.ok));
    assert_eq!(report.global.tests[0].name, "tool-source");
    assert!(report.global.tests[0].detail.starts_with("skipped"));
}
