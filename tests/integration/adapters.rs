//! Backend adapters against mocked backends: discovery fallback, error excerpts,
//! streamed tool-call aggregation per dialect.

use byok_bridge::config::ProviderType;
use byok_bridge::drivers::{ChatCall, TextCall};
use byok_bridge::normalize::validate_instance;
use byok_bridge::pipeline::collect_chunks;
use byok_bridge::selftest::fixtures::synthetic_tool;
use byok_bridge::types::{CanonicalChatRequest, Message, StopReason, ToolDef};
use byok_bridge::Error;
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::mock_server::{MockServerFixture, SHORT, TEST_KEY};

fn view_tool() -> ToolDef {
    ToolDef::new(
        "view",
        "View a file",
        json!({"type": "object", "properties": {"path": {"type": "string"}}, "required": ["path"]}),
    )
}

#[tokio::test]
async fn test_model_discovery_falls_back_to_versioned_path() {
    let fixture = MockServerFixture::new().await;
    let not_found = fixture
        .mock_json("GET", "/models", 404, r#"{"error":"not found"}"#)
        .await;
    let versioned = fixture
        .mock_json(
            "GET",
            "/v1/models",
            200,
            r#"{"data":[{"id":"gpt-x"},{"id":"gpt-y"},{"id":"gpt-x"}]}"#,
        )
        .await;

    let discovery = MockServerFixture::adapter(ProviderType::OpenAiCompatible)
        .list_models(&fixture.endpoint(), SHORT, CancellationToken::new())
        .await
        .unwrap();

    not_found.assert_async().await;
    versioned.assert_async().await;
    assert_eq!(discovery.models, vec!["gpt-x", "gpt-y"]);
    assert_eq!(discovery.attempted_urls.len(), 2);
    assert!(discovery.url_used.unwrap().ends_with("/v1/models"));
}

#[tokio::test]
async fn test_non_404_discovery_error_is_not_retried() {
    let fixture = MockServerFixture::new().await;
    let _forbidden = fixture.mock_json("GET", "/models", 403, r#"{"error":"forbidden"}"#).await;
    let versioned = {
        let mut server = fixture.server.lock().await;
        server
            .mock("GET", "/v1/models")
            .with_status(200)
            .with_body(r#"{"data":[]}"#)
            .expect(0)
            .create_async()
            .await
    };

    let err = MockServerFixture::adapter(ProviderType::OpenAiCompatible)
        .list_models(&fixture.endpoint(), SHORT, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.upstream_status(), Some(403));
    versioned.assert_async().await;
}

#[tokio::test]
async fn test_unauthorized_excerpt_never_contains_the_credential() {
    let fixture = MockServerFixture::new().await;
    let body = format!(r#"{{"error":{{"message":"Incorrect API key provided: {}"}}}}"#, TEST_KEY);
    let _mock = fixture.mock_json("POST", "/chat/completions", 401, &body).await;

    let call = TextCall::new(fixture.endpoint(), "gpt-x", vec![Message::user("hi")]).with_timeout(SHORT);
    let err = MockServerFixture::adapter(ProviderType::OpenAiCompatible)
        .complete_text(&call)
        .await
        .unwrap_err();

    match &err {
        Error::UpstreamHttp { status, url, excerpt } => {
            assert_eq!(*status, 401);
            assert!(!excerpt.contains(TEST_KEY), "{}", excerpt);
            assert!(!url.contains(TEST_KEY));
            assert!(excerpt.chars().count() <= 300);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(err.is_auth_failure());
    assert!(!err.to_string().contains(TEST_KEY));
}

#[tokio::test]
async fn test_complete_text_openai() {
    let fixture = MockServerFixture::new().await;
    let _mock = fixture
        .mock_json(
            "POST",
            "/chat/completions",
            200,
            r#"{"choices":[{"message":{"role":"assistant","content":"pong"},"finish_reason":"stop"}]}"#,
        )
        .await;
    let call = TextCall::new(fixture.endpoint(), "gpt-x", vec![Message::user("ping")]).with_timeout(SHORT);
    let out = MockServerFixture::adapter(ProviderType::OpenAiCompatible)
        .complete_text(&call)
        .await
        .unwrap();
    assert_eq!(out, "pong");
}

#[tokio::test]
async fn test_stream_text_deltas_in_order() {
    let fixture = MockServerFixture::new().await;
    let _mock = fixture
        .mock_sse_stream(
            "/chat/completions",
            vec![
                r#"{"choices":[{"delta":{"role":"assistant"},"index":0}]}"#,
                r#"{"choices":[{"delta":{"content":"1 2"},"index":0}]}"#,
                r#"{"choices":[{"delta":{"content":" 3"},"index":0}]}"#,
                r#"{"choices":[{"delta":{},"index":0,"finish_reason":"stop"}]}"#,
                "[DONE]",
            ],
        )
        .await;
    let call = TextCall::new(fixture.endpoint(), "gpt-x", vec![Message::user("count")]).with_timeout(SHORT);
    let deltas: Vec<String> = MockServerFixture::adapter(ProviderType::OpenAiCompatible)
        .stream_text_deltas(&call)
        .await
        .unwrap()
        .map(|d| d.unwrap())
        .collect()
        .await;
    assert_eq!(deltas, vec!["1 2", " 3"]);
}

#[tokio::test]
async fn test_openai_tool_call_fragments_are_aggregated() {
    let fixture = MockServerFixture::new().await;
    let _mock = fixture
        .mock_sse_stream(
            "/chat/completions",
            vec![
                r#"{"choices":[{"delta":{"content":"Let me look."},"index":0}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"view","arguments":""}}]},"index":0}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"pa"}}]},"index":0}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"th\":\"src/main.rs\"}"}}]},"index":0}]}"#,
                r#"{"choices":[{"delta":{},"index":0,"finish_reason":"tool_calls"}]}"#,
                r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":7}}"#,
                "[DONE]",
            ],
        )
        .await;

    let mut request = CanonicalChatRequest::from_message("show main");
    request.tool_definitions = vec![view_tool()];
    let call = ChatCall::new(fixture.endpoint(), "gpt-x", request).with_timeout(SHORT);
    let stream = MockServerFixture::adapter(ProviderType::OpenAiCompatible)
        .chat_stream_chunks(&call)
        .await
        .unwrap();
    let turn = collect_chunks(stream).await.unwrap();

    assert_eq!(turn.text, "Let me look.");
    let uses = turn.tool_uses();
    assert_eq!(uses.len(), 1);
    assert_eq!(uses[0].tool_use_id, "call_1");
    assert_eq!(uses[0].tool_name, "view");
    assert_eq!(uses[0].input(), json!({"path": "src/main.rs"}));
    assert_eq!(turn.stop_reason, Some(StopReason::ToolUseRequested));
    let usage = turn.usage().unwrap();
    assert_eq!(usage.input_tokens, 12);
    assert_eq!(usage.output_tokens, 7);
}

#[tokio::test]
async fn test_parallel_calls_with_missing_index_are_not_merged() {
    let fixture = MockServerFixture::new().await;
    let _mock = fixture
        .mock_sse_stream(
            "/chat/completions",
            vec![
                r#"{"choices":[{"delta":{"tool_calls":[{"id":"call_a","type":"function","function":{"name":"view","arguments":"{\"path\":\"a\"}"}}]},"index":0}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"id":"call_b","type":"function","function":{"name":"grep","arguments":"{\"q\":\"b\"}"}}]},"index":0}]}"#,
                r#"{"choices":[{"delta":{},"index":0,"finish_reason":"tool_calls"}]}"#,
                "[DONE]",
            ],
        )
        .await;

    let mut request = CanonicalChatRequest::from_message("look around");
    request.tool_definitions = vec![view_tool()];
    let call = ChatCall::new(fixture.endpoint(), "gpt-x", request).with_timeout(SHORT);
    let stream = MockServerFixture::adapter(ProviderType::OpenAiCompatible)
        .chat_stream_chunks(&call)
        .await
        .unwrap();
    let turn = collect_chunks(stream).await.unwrap();

    let uses: Vec<_> = turn
        .tool_uses()
        .into_iter()
        .map(|u| (u.tool_use_id.clone(), u.tool_name.clone(), u.input()))
        .collect();
    assert_eq!(
        uses,
        vec![
            ("call_a".to_string(), "view".to_string(), json!({"path": "a"})),
            ("call_b".to_string(), "grep".to_string(), json!({"q": "b"})),
        ]
    );
    assert_eq!(turn.stop_reason, Some(StopReason::ToolUseRequested));
}

#[tokio::test]
async fn test_in_band_stream_error_never_contains_the_credential() {
    let fixture = MockServerFixture::new().await;
    let frame = format!(
        r#"{{"error":{{"message":"Incorrect API key provided: {}","type":"invalid_request_error"}}}}"#,
        TEST_KEY
    );
    let _mock = fixture.mock_sse_stream("/chat/completions", vec![frame.as_str()]).await;

    let call = ChatCall::new(fixture.endpoint(), "gpt-x", CanonicalChatRequest::from_message("hi")).with_timeout(SHORT);
    let stream = MockServerFixture::adapter(ProviderType::OpenAiCompatible)
        .chat_stream_chunks(&call)
        .await
        .unwrap();
    let err = collect_chunks(stream).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("Incorrect API key provided"), "{}", message);
    assert!(!message.contains(TEST_KEY), "{}", message);
}

#[tokio::test]
async fn test_responses_strict_nulls_are_dropped_from_tool_input() {
    let fixture = MockServerFixture::new().await;
    let _mock = fixture
        .mock_sse_stream(
            "/responses",
            vec![
                r#"{"type":"response.output_item.added","output_index":0,"item":{"type":"function_call","id":"fc_1","call_id":"call_1","name":"selftest_echo","arguments":""}}"#,
                r#"{"type":"response.function_call_arguments.delta","output_index":0,"item_id":"fc_1","delta":"{\"message\":\"hello\",\"color\":\"red\",\"options\":null}"}"#,
                r#"{"type":"response.output_item.done","output_index":0,"item":{"type":"function_call","id":"fc_1","call_id":"call_1","name":"selftest_echo","arguments":"{\"message\":\"hello\",\"color\":\"red\",\"options\":null}"}}"#,
                r#"{"type":"response.completed","response":{"status":"completed","usage":{"input_tokens":30,"output_tokens":12}}}"#,
            ],
        )
        .await;

    let tool = synthetic_tool();
    let mut request = CanonicalChatRequest::from_message("call the echo tool");
    request.tool_definitions = vec![tool.clone()];
    let call = ChatCall::new(fixture.endpoint(), "gpt-r", request).with_timeout(SHORT);
    let stream = MockServerFixture::adapter(ProviderType::OpenAiResponses)
        .chat_stream_chunks(&call)
        .await
        .unwrap();
    let turn = collect_chunks(stream).await.unwrap();

    let uses = turn.tool_uses();
    assert_eq!(uses.len(), 1);
    assert_eq!(uses[0].tool_use_id, "call_1");
    assert_eq!(uses[0].input(), json!({"message": "hello", "color": "red"}));
    assert!(validate_instance(&tool.input_schema, &uses[0].input()).is_ok());
    assert_eq!(turn.stop_reason, Some(StopReason::ToolUseRequested));
}

#[tokio::test]
async fn test_anthropic_stream_with_text_and_tool_use() {
    let fixture = MockServerFixture::new().await;
    let _mock = fixture
        .mock_sse_stream(
            "/v1/messages",
            vec![
                "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":20,\"output_tokens\":1}}}",
                "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}",
                "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Opening it.\"}}",
                "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}",
                "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_1\",\"name\":\"view\",\"input\":{}}}",
                "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"path\\\":\"}}",
                "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"\\\"a.rs\\\"}\"}}",
                "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":1}",
                "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":15}}",
                "event: message_stop\ndata: {\"type\":\"message_stop\"}",
            ],
        )
        .await;

    let mut request = CanonicalChatRequest::from_message("open a.rs");
    request.tool_definitions = vec![view_tool()];
    let call = ChatCall::new(fixture.endpoint(), "claude-x", request).with_timeout(SHORT);
    let stream = MockServerFixture::adapter(ProviderType::Anthropic)
        .chat_stream_chunks(&call)
        .await
        .unwrap();
    let turn = collect_chunks(stream).await.unwrap();

    assert_eq!(turn.text, "Opening it.");
    let uses = turn.tool_uses();
    assert_eq!(uses.len(), 1);
    assert_eq!(uses[0].tool_use_id, "toolu_1");
    assert_eq!(uses[0].input(), json!({"path": "a.rs"}));
    assert_eq!(turn.stop_reason, Some(StopReason::ToolUseRequested));
    assert_eq!(turn.usage().unwrap().input_tokens, 20);
}

#[tokio::test]
async fn test_gemini_key_travels_as_query_parameter() {
    let fixture = MockServerFixture::new().await;
    let mock = {
        let mut server = fixture.server.lock().await;
        server
            .mock("POST", "/v1beta/models/gemini-x:streamGenerateContent")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("alt".into(), "sse".into()),
                mockito::Matcher::UrlEncoded("key".into(), TEST_KEY.into()),
            ]))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(concat!(
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi\"}]}}]}\n\n",
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"functionCall\":{\"name\":\"view\",\"args\":{\"path\":\"b.rs\"}}}]},\"finishReason\":\"STOP\"}],",
                "\"usageMetadata\":{\"promptTokenCount\":9,\"candidatesTokenCount\":4}}\n\n"
            ))
            .create_async()
            .await
    };

    let mut request = CanonicalChatRequest::from_message("open b.rs");
    request.tool_definitions = vec![view_tool()];
    let call = ChatCall::new(fixture.endpoint(), "models/gemini-x", request).with_timeout(SHORT);
    let stream = MockServerFixture::adapter(ProviderType::Gemini)
        .chat_stream_chunks(&call)
        .await
        .unwrap();
    let turn = collect_chunks(stream).await.unwrap();
    mock.assert_async().await;

    assert_eq!(turn.text, "Hi");
    let uses = turn.tool_uses();
    assert_eq!(uses.len(), 1);
    assert!(!uses[0].tool_use_id.is_empty());
    assert_eq!(uses[0].input(), json!({"path": "b.rs"}));
    assert_eq!(turn.stop_reason, Some(StopReason::ToolUseRequested));
}

#[tokio::test]
async fn test_responses_stream_and_missing_terminal() {
    let fixture = MockServerFixture::new().await;
    let _mock = fixture
        .mock_sse_stream(
            "/responses",
            vec![
                r#"{"type":"response.output_text.delta","delta":"Hello"}"#,
                r#"{"type":"response.output_text.delta","delta":" there"}"#,
            ],
        )
        .await;

    let call = ChatCall::new(fixture.endpoint(), "gpt-r", CanonicalChatRequest::from_message("hi")).with_timeout(SHORT);
    let stream = MockServerFixture::adapter(ProviderType::OpenAiResponses)
        .chat_stream_chunks(&call)
        .await
        .unwrap();
    let chunks: Vec<_> = stream.map(|c| c.unwrap()).collect().await;

    let terminal: Vec<_> = chunks.iter().filter(|c| c.is_terminal()).collect();
    assert_eq!(terminal.len(), 1);
    assert!(chunks.last().unwrap().is_terminal());
    assert_eq!(terminal[0].stop_reason, Some(StopReason::EndTurn));
    let text: String = chunks.iter().filter_map(|c| c.text.clone()).collect();
    assert_eq!(text, "Hello there");
}

#[tokio::test]
async fn test_cancelled_call_surfaces_as_cancellation() {
    let fixture = MockServerFixture::new().await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let call = TextCall::new(fixture.endpoint(), "gpt-x", vec![Message::user("hi")])
        .with_timeout(SHORT)
        .with_cancel(cancel);
    let err = MockServerFixture::adapter(ProviderType::OpenAiCompatible)
        .complete_text(&call)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}
