//! Bridge routing against a mocked backend: rule modes, model discovery fallback,
//! and chat/task calls over the resolved route.

use byok_bridge::config::ProviderType;
use byok_bridge::pipeline::collect_chunks;
use byok_bridge::routing::disabled_stub;
use byok_bridge::{Bridge, BridgeConfig, RouteMode, StopReason};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::mock_server::{MockServerFixture, SHORT, TEST_KEY};

fn config_yaml(base_url: &str, with_model: bool) -> String {
    let model = if with_model { "    default_model: gpt-static\n" } else { "" };
    format!(
        r#"
enabled: true
providers:
  - id: local
    type: openai-compatible
    base_url: {base}
    api_key: {key}
{model}routing:
  rules:
    chat-stream:
      mode: byok
      provider_id: local
    /generate-conversation-title:
      mode: byok
      provider_id: missing
    /record-session-events: disabled
    /get-models: official
"#,
        base = base_url,
        key = TEST_KEY,
        model = model,
    )
}

fn bridge(fixture: &MockServerFixture, with_model: bool) -> Bridge {
    let config = BridgeConfig::from_yaml_str(&config_yaml(&fixture.base_url, with_model)).unwrap();
    Bridge::builder(config)
        .transport(MockServerFixture::transport())
        .call_timeout(SHORT)
        .discovery_timeout(SHORT)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_rule_modes() {
    let fixture = MockServerFixture::new().await;
    let bridge = bridge(&fixture, true);
    let body = json!({"model": "client-model"});

    let route = bridge.route("/chat-stream", &body, true, CancellationToken::new()).await.unwrap();
    assert_eq!(route.mode, RouteMode::Byok);
    assert_eq!(route.provider_id(), Some("local"));
    assert_eq!(route.model.as_deref(), Some("gpt-static"));
    assert_eq!(route.requested_model.as_deref(), Some("client-model"));

    let route = bridge.route("/record-session-events", &body, true, CancellationToken::new()).await.unwrap();
    assert_eq!(route.mode, RouteMode::Disabled);
    assert_eq!(disabled_stub(&route.endpoint), json!({}));

    let route = bridge.route("/get-models", &body, true, CancellationToken::new()).await.unwrap();
    assert_eq!(route.mode, RouteMode::Official);

    let route = bridge.route("/unlisted", &body, true, CancellationToken::new()).await.unwrap();
    assert_eq!(route.mode, RouteMode::Official);
    assert_eq!(route.reason, "no rule");
}

#[tokio::test]
async fn test_runtime_off_routes_everything_officially() {
    let fixture = MockServerFixture::new().await;
    let bridge = bridge(&fixture, true);
    for endpoint in ["/chat-stream", "/record-session-events", "/generate-conversation-title"] {
        let route = bridge.route(endpoint, &json!({}), false, CancellationToken::new()).await.unwrap();
        assert_eq!(route.mode, RouteMode::Official, "{}", endpoint);
        assert!(route.provider.is_none());
    }
}

#[tokio::test]
async fn test_unknown_rule_provider_falls_back_to_first() {
    let fixture = MockServerFixture::new().await;
    let bridge = bridge(&fixture, true);
    let route = bridge
        .route("/generate-conversation-title", &json!({}), true, CancellationToken::new())
        .await
        .unwrap();
    assert!(route.is_byok());
    assert_eq!(route.provider_id(), Some("local"));
    assert!(route.reason.contains("fallback"));
}

#[tokio::test]
async fn test_model_resolved_through_discovery() {
    let fixture = MockServerFixture::new().await;
    let models = fixture
        .mock_json("GET", "/models", 200, r#"{"data":[{"id":"discovered-1"},{"id":"discovered-2"}]}"#)
        .await;
    let bridge = bridge(&fixture, false);

    let route = bridge.route("/chat-stream", &json!({}), true, CancellationToken::new()).await.unwrap();
    models.assert_async().await;
    assert_eq!(route.model.as_deref(), Some("discovered-1"));
    assert!(route.reason.contains("discovered"));
}

#[tokio::test]
async fn test_discovery_failure_surfaces_upstream_error() {
    let fixture = MockServerFixture::new().await;
    let _models = fixture.mock_json("GET", "/models", 500, r#"{"error":"boom"}"#).await;
    let bridge = bridge(&fixture, false);

    let err = bridge
        .route("/chat-stream", &json!({}), true, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.upstream_status(), Some(500));
}

#[tokio::test]
async fn test_chat_stream_over_byok_route() {
    let fixture = MockServerFixture::new().await;
    let _chat = fixture
        .mock_sse_stream(
            "/chat/completions",
            vec![
                r#"{"choices":[{"delta":{"content":"Hello"},"index":0}]}"#,
                r#"{"choices":[{"delta":{},"index":0,"finish_reason":"stop"}]}"#,
                "[DONE]",
            ],
        )
        .await;
    let bridge = bridge(&fixture, true);
    let body = json!({
        "message": "hi",
        "tool_definitions": [{"name": "view", "description": "View", "input_schema": {"type": "object"}}]
    });

    let route = bridge.route("/chat-stream", &body, true, CancellationToken::new()).await.unwrap();
    let stream = bridge.chat_stream(&route, &body, CancellationToken::new()).await.unwrap();
    let turn = collect_chunks(stream).await.unwrap();

    assert_eq!(turn.text, "Hello");
    assert_eq!(turn.stop_reason, Some(StopReason::EndTurn));
    let captured = bridge.context().get().unwrap();
    assert_eq!(captured.tools.len(), 1);
    assert_eq!(captured.source, "/chat-stream");
}

#[tokio::test]
async fn test_title_task_is_cleaned() {
    let fixture = MockServerFixture::new().await;
    let _chat = fixture
        .mock_json(
            "POST",
            "/chat/completions",
            200,
            r#"{"choices":[{"message":{"role":"assistant","content":"  \"Fix flaky parser test\"\n"}}]}"#,
        )
        .await;
    let bridge = bridge(&fixture, true);
    let body = json!({"chat_history": [{"request_message": "the parser test fails sometimes", "response_text": "Looking"}]});

    let route = bridge
        .route("/generate-conversation-title", &body, true, CancellationToken::new())
        .await
        .unwrap();
    let title = bridge.complete_task(&route, &body, CancellationToken::new()).await.unwrap();
    assert_eq!(title, "Fix flaky parser test");
}

#[tokio::test]
async fn test_update_config_swaps_routing() {
    let fixture = MockServerFixture::new().await;
    let bridge = bridge(&fixture, true);
    let mut config = (*bridge.config()).clone();
    config.routing.rules.clear();
    bridge.update_config(config).unwrap();

    let route = bridge.route("/chat-stream", &json!({}), true, CancellationToken::new()).await.unwrap();
    assert_eq!(route.mode, RouteMode::Official);
    assert_eq!(bridge.config().providers[0].provider_type, Some(ProviderType::OpenAiCompatible));
}
