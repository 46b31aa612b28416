use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::client::core::Bridge;
use crate::compact::{HistoryCompactor, NoopCompactor};
use crate::config::BridgeConfig;
use crate::context::BridgeContext;
use crate::drivers::{DEFAULT_CALL_TIMEOUT, DEFAULT_DISCOVERY_TIMEOUT};
use crate::transport::HttpTransport;
use crate::Result;

/// Builder for a [`Bridge`].
///
/// Keep this surface area small and predictable. Defaults can also be tuned via env:
/// - `BYOK_CALL_TIMEOUT_MS` (default 120000)
/// - `BYOK_DISCOVERY_TIMEOUT_MS` (default 15000)
pub struct BridgeBuilder {
    config: BridgeConfig,
    context: Option<Arc<BridgeContext>>,
    transport: Option<Arc<HttpTransport>>,
    compactor: Option<Arc<dyn HistoryCompactor>>,
    call_timeout: Option<Duration>,
    discovery_timeout: Option<Duration>,
    chat_system_prompt: String,
}

fn env_ms(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

impl BridgeBuilder {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            context: None,
            transport: None,
            compactor: None,
            call_timeout: None,
            discovery_timeout: None,
            chat_system_prompt: String::new(),
        }
    }

    /// Share a context with other components (e.g. the self-test harness).
    pub fn context(mut self, context: Arc<BridgeContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Use an existing transport instead of building one from env.
    pub fn transport(mut self, transport: Arc<HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Install a history compactor. Default is a no-op.
    pub fn compactor(mut self, compactor: Arc<dyn HistoryCompactor>) -> Self {
        self.compactor = Some(compactor);
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = Some(timeout);
        self
    }

    /// System prompt sent with every agentic chat call.
    pub fn chat_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.chat_system_prompt = prompt.into();
        self
    }

    pub fn build(self) -> Result<Bridge> {
        self.config.validate()?;
        let transport = match self.transport {
            Some(t) => t,
            None => Arc::new(HttpTransport::new()?),
        };
        Ok(Bridge {
            config: ArcSwap::from_pointee(self.config),
            context: self.context.unwrap_or_default(),
            transport,
            compactor: self.compactor.unwrap_or_else(|| Arc::new(NoopCompactor)),
            call_timeout: self
                .call_timeout
                .or_else(|| env_ms("BYOK_CALL_TIMEOUT_MS"))
                .unwrap_or(DEFAULT_CALL_TIMEOUT),
            discovery_timeout: self
                .discovery_timeout
                .or_else(|| env_ms("BYOK_DISCOVERY_TIMEOUT_MS"))
                .unwrap_or(DEFAULT_DISCOVERY_TIMEOUT),
            chat_system_prompt: self.chat_system_prompt,
        })
    }
}
