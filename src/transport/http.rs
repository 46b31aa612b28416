use crate::drivers::DriverRequest;
use crate::transport::{excerpt, redact_url, TransportError};
use crate::{BoxStream, Error, Result};
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::Proxy;
use std::env;
use std::time::Duration;

/// Shared reqwest client used by every backend adapter.
///
/// No whole-request timeout is installed on the client: streamed turns can legitimately
/// run for minutes, so deadlines are applied per call by the adapter.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(
                env_parse("BYOK_HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(15),
            ))
            .pool_max_idle_per_host(env_parse("BYOK_HTTP_POOL_MAX_IDLE_PER_HOST").unwrap_or(8))
            .pool_idle_timeout(Some(Duration::from_secs(
                env_parse("BYOK_HTTP_POOL_IDLE_TIMEOUT_SECS").unwrap_or(90),
            )))
            // Conservative HTTP/2 keepalive defaults for long-lived streams.
            .http2_adaptive_window(true)
            .http2_keep_alive_interval(Some(Duration::from_secs(30)))
            .http2_keep_alive_timeout(Duration::from_secs(10));

        if let Ok(proxy_url) = env::var("BYOK_PROXY_URL") {
            match Proxy::all(&proxy_url) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(e) => tracing::warn!(error = %e, "Ignoring invalid BYOK_PROXY_URL"),
            }
        }

        let client = builder
            .build()
            .map_err(|e| Error::Transport(TransportError::Other(e.to_string())))?;
        Ok(Self { client })
    }

    /// Wrap an existing client (tests, custom TLS setups).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Send the request and fail with [`Error::UpstreamHttp`] on any non-2xx status.
    pub async fn send(&self, request: &DriverRequest, secrets: &[String]) -> Result<reqwest::Response> {
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", redact_url(&request.url, secrets), e)))?;
        let mut req = match request.method.to_uppercase().as_str() {
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "DELETE" => self.client.delete(url),
            _ => self.client.get(url),
        };
        for (k, v) in &request.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if request.stream {
            req = req.header("accept", "text/event-stream");
        }
        if let Some(body) = &request.body {
            req = req.json(body);
        }

        tracing::debug!(
            method = %request.method,
            url = %redact_url(&request.url, secrets),
            stream = request.stream,
            "Sending upstream request"
        );

        let response = req.send().await.map_err(TransportError::Http)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let err = Error::UpstreamHttp {
            status: status.as_u16(),
            url: redact_url(&request.url, secrets),
            excerpt: excerpt(&body, secrets),
        };
        tracing::debug!(status = status.as_u16(), "Upstream returned non-success status");
        Err(err)
    }

    pub async fn send_json(&self, request: &DriverRequest, secrets: &[String]) -> Result<serde_json::Value> {
        let response = self.send(request, secrets).await?;
        let text = response.text().await.map_err(TransportError::Http)?;
        serde_json::from_str(&text).map_err(|e| {
            Error::validation_with_context(
                format!("upstream returned invalid JSON: {}", e),
                crate::ErrorContext::new()
                    .with_details(excerpt(&text, secrets))
                    .with_source("transport"),
            )
        })
    }

    pub async fn send_stream(
        &self,
        request: &DriverRequest,
        secrets: &[String],
    ) -> Result<BoxStream<'static, Bytes>> {
        let response = self.send(request, secrets).await?;
        let byte_stream = response
            .bytes_stream()
            .map_err(|e| Error::Transport(TransportError::Http(e)));
        Ok(Box::pin(byte_stream))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}
