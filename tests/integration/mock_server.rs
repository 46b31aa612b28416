//! Mock HTTP server setup for integration tests

use std::sync::Arc;
use std::time::Duration;

use byok_bridge::config::{Credential, ProviderConfig, ProviderType};
use byok_bridge::drivers::{BackendAdapter, ProviderEndpoint};
use byok_bridge::transport::HttpTransport;
use mockito::{Matcher, Mock, Server, ServerGuard};
use tokio::sync::Mutex;

pub const TEST_KEY: &str = "sk-test-secret-key-1234";

/// Test fixture that manages a mock server
pub struct MockServerFixture {
    pub server: Arc<Mutex<ServerGuard>>,
    pub base_url: String,
}

impl MockServerFixture {
    pub async fn new() -> Self {
        let server = Server::new_async().await;
        let base_url = server.url();
        Self {
            server: Arc::new(Mutex::new(server)),
            base_url,
        }
    }

    pub fn transport() -> Arc<HttpTransport> {
        Arc::new(HttpTransport::with_client(reqwest::Client::new()))
    }

    pub fn adapter(provider_type: ProviderType) -> BackendAdapter {
        BackendAdapter::new(provider_type, Self::transport())
    }

    pub fn endpoint(&self) -> ProviderEndpoint {
        ProviderEndpoint::new(&self.base_url, Credential::bearer(TEST_KEY))
    }

    pub fn provider(&self, id: &str, provider_type: ProviderType) -> ProviderConfig {
        ProviderConfig::new(id, provider_type, &self.base_url).with_api_key(TEST_KEY)
    }

    /// Create a mock for a successful streaming response (SSE). Each chunk becomes one
    /// `data:` frame unless it already carries SSE fields.
    pub async fn mock_sse_stream(&self, path: &str, chunks: Vec<&str>) -> Mock {
        let mut server = self.server.lock().await;
        let body = chunks
            .iter()
            .map(|chunk| {
                if chunk.starts_with("data: ") || chunk.starts_with("event: ") {
                    format!("{}\n\n", chunk)
                } else {
                    format!("data: {}\n\n", chunk)
                }
            })
            .collect::<Vec<_>>()
            .join("");

        server
            .mock("POST", path)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await
    }

    /// Create a mock for a JSON response
    pub async fn mock_json(&self, method: &str, path: &str, status: usize, body: &str) -> Mock {
        let mut server = self.server.lock().await;
        server
            .mock(method, path)
            .match_query(Matcher::Any)
            .with_status(status)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await
    }
}

pub const SHORT: Duration = Duration::from_secs(5);
