//! 自检模块：逐个后端验证路由、协议转换与工具调用链路
//!
//! Self-test harness. Certifies a [`BridgeConfig`] before it is trusted by running every
//! provider through every translation path, plus a global phase over the host's real
//! tool set.
//!
//! Providers are probed one at a time, in configuration order. Probes are
//! failure-isolated: an error becomes a failed [`TestResult`] and the next probe runs.
//! Only a provider whose configuration is unusable (or whose model cannot be resolved)
//! has its remaining probes skipped. No probe is retried.
//!
//! ```no_run
//! use std::sync::Arc;
//! use byok_bridge::config::BridgeConfig;
//! use byok_bridge::context::BridgeContext;
//! use byok_bridge::selftest::SelfTest;
//! use byok_bridge::transport::HttpTransport;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> byok_bridge::Result<()> {
//! let config = BridgeConfig::from_path("byok.yaml")?;
//! let harness = SelfTest::new(Arc::new(HttpTransport::new()?), Arc::new(BridgeContext::new()));
//! let report = harness.run(&config, CancellationToken::new()).await;
//! println!("{}", serde_json::to_string_pretty(&report)?);
//! # Ok(())
//! # }
//! ```

mod exec;
pub mod fixtures;
mod probes;
pub mod report;
mod tool_probes;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::client::Bridge;
use crate::config::{BridgeConfig, ProviderConfig};
use crate::context::BridgeContext;
use crate::drivers::{BackendAdapter, ProviderEndpoint};
use crate::host::ToolHost;
use crate::normalize::TaskKind;
use crate::transport::HttpTransport;
use crate::types::ToolDef;
use crate::{Error, ErrorContext};

pub use report::{GlobalSection, RunLog, SelfTestEntry, SelfTestReport, TestResult};
pub use tool_probes::{check_round_trip_pairing, ROUND_TRIP_BATCH_SIZE};

use probes::{ProviderProbe, ToolTurn};

/// Deadline of one provider probe.
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 120_000;
/// Deadline of model discovery inside a provider run.
pub const MODEL_DISCOVERY_TIMEOUT_MS: u64 = 15_000;
/// Deadline of fetching the host's tool definitions.
pub const SCHEMA_FETCH_TIMEOUT_MS: u64 = 12_000;
/// Deadline of one real tool execution.
pub const TOOL_CALL_TIMEOUT_MS: u64 = 20_000;

pub(crate) const MODEL_DISCOVERY_TIMEOUT: Duration = Duration::from_millis(MODEL_DISCOVERY_TIMEOUT_MS);
pub(crate) const SCHEMA_FETCH_TIMEOUT: Duration = Duration::from_millis(SCHEMA_FETCH_TIMEOUT_MS);
pub(crate) const TOOL_CALL_TIMEOUT: Duration = Duration::from_millis(TOOL_CALL_TIMEOUT_MS);

/// Knobs of one self-test run.
#[derive(Debug, Clone)]
pub struct SelfTestOptions {
    /// Per-probe deadline.
    pub probe_timeout: Duration,
    /// Only probe these provider ids; all providers when `None`.
    pub providers: Option<Vec<String>>,
    /// Execute real tools through the host against a scratch directory.
    pub real_tool_execution: bool,
    /// Incremental log lines for the host UI.
    pub log: Option<UnboundedSender<String>>,
}

impl Default for SelfTestOptions {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            providers: None,
            real_tool_execution: true,
            log: None,
        }
    }
}

impl SelfTestOptions {
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_providers(mut self, ids: Vec<String>) -> Self {
        self.providers = Some(ids);
        self
    }

    pub fn with_real_tool_execution(mut self, enabled: bool) -> Self {
        self.real_tool_execution = enabled;
        self
    }

    pub fn with_log(mut self, tx: UnboundedSender<String>) -> Self {
        self.log = Some(tx);
        self
    }

    fn selects(&self, provider: &ProviderConfig) -> bool {
        self.providers
            .as_ref()
            .map_or(true, |ids| ids.iter().any(|id| id == &provider.id))
    }
}

/// The harness. Cheap to clone; holds no per-run state.
#[derive(Clone)]
pub struct SelfTest {
    transport: Arc<HttpTransport>,
    context: Arc<BridgeContext>,
    host: Option<Arc<dyn ToolHost>>,
    options: SelfTestOptions,
}

impl std::fmt::Debug for SelfTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfTest")
            .field("has_host", &self.host.is_some())
            .field("options", &self.options)
            .finish()
    }
}

impl SelfTest {
    pub fn new(transport: Arc<HttpTransport>, context: Arc<BridgeContext>) -> Self {
        Self {
            transport,
            context,
            host: None,
            options: SelfTestOptions::default(),
        }
    }

    /// Harness sharing the bridge's transport and captured tool set.
    pub fn for_bridge(bridge: &Bridge) -> Self {
        Self::new(bridge.transport(), bridge.context().clone())
    }

    pub fn with_host(mut self, host: Arc<dyn ToolHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_options(mut self, options: SelfTestOptions) -> Self {
        self.options = options;
        self
    }

    /// Run the global phase, then every selected provider. Always returns a complete
    /// report; failures are recorded, never raised.
    pub async fn run(&self, config: &BridgeConfig, cancel: CancellationToken) -> SelfTestReport {
        let log = RunLog::new(self.options.log.clone());
        let mut report = SelfTestReport::new(uuid::Uuid::new_v4().to_string());
        let selected: Vec<&ProviderConfig> = config.providers.iter().filter(|p| self.options.selects(p)).collect();
        log.line(format!(
            "self-test {} started: {} of {} provider(s)",
            report.run_id,
            selected.len(),
            config.providers.len()
        ));

        let tools = self.global_phase(&log, &mut report, &cancel).await;

        for provider in selected {
            let entry = if cancel.is_cancelled() {
                cancelled_entry(&log, provider)
            } else {
                self.probe_provider(&log, provider, &tools, &cancel).await
            };
            report.providers.push(entry);
        }

        report.finish();
        log.line(format!(
            "self-test {} finished: {} ({} failed test(s))",
            report.run_id,
            if report.ok { "ok" } else { "FAILED" },
            report.failed_tests().len()
        ));
        report
    }

    async fn global_phase(&self, log: &RunLog, report: &mut SelfTestReport, cancel: &CancellationToken) -> Vec<ToolDef> {
        let started = Instant::now();
        let fetched = tool_probes::fetch_tools(&self.context, self.host.as_ref(), SCHEMA_FETCH_TIMEOUT, cancel).await;
        let tools = match fetched {
            Ok((tools, detail)) => {
                report.global.tests.push(log.record("tool-source", started, Ok(detail)));
                tools
            }
            Err(e) => {
                report.global.tests.push(log.record("tool-source", started, Err(e)));
                Vec::new()
            }
        };
        report.global.captured_tools = tools.len();
        if tools.is_empty() {
            return tools;
        }

        report.global.tests.extend(tool_probes::schema_sample_checks(log, &tools));
        report.global.tests.extend(tool_probes::schema_dialect_checks(log, &tools));
        if self.options.real_tool_execution {
            if let Some(host) = &self.host {
                let results = exec::run_real_tool_execution(log, host, &tools, &report.run_id, cancel).await;
                report.global.tests.extend(results);
            }
        }
        tools
    }

    async fn probe_provider(
        &self,
        log: &RunLog,
        provider: &ProviderConfig,
        tools: &[ToolDef],
        cancel: &CancellationToken,
    ) -> SelfTestEntry {
        let started = Instant::now();
        let mut entry = SelfTestEntry::new(
            &provider.id,
            provider.provider_type.map_or("unknown", |t| t.as_str()),
        );
        log.line(format!("provider {} ({})", entry.provider_id, entry.provider_type));

        let t0 = Instant::now();
        let provider_type = match provider.check() {
            Ok(t) => {
                entry.tests.push(log.record("config-check", t0, Ok(format!("type={}", t))));
                t
            }
            Err(e) => {
                entry.tests.push(log.record("config-check", t0, Err(e)));
                entry.finish(started);
                return entry;
            }
        };

        let adapter = BackendAdapter::new(provider_type, self.transport.clone());
        let endpoint = ProviderEndpoint::from_provider(provider);

        let t0 = Instant::now();
        let discovered = match adapter.list_models(&endpoint, MODEL_DISCOVERY_TIMEOUT, cancel.clone()).await {
            Ok(d) => {
                let detail = format!(
                    "{} model(s) via {}",
                    d.models.len(),
                    d.url_used.as_deref().unwrap_or("-")
                );
                entry.tests.push(log.record("model-discovery", t0, Ok(detail)));
                d.models
            }
            Err(e) => {
                entry.tests.push(log.record("model-discovery", t0, Err(e)));
                Vec::new()
            }
        };

        let Some(model) = provider.static_model().or_else(|| discovered.first().cloned()) else {
            let err = Error::configuration_with_context(
                "no model could be resolved: no default, declared or discovered model",
                ErrorContext::new()
                    .with_field_path(format!("providers.{}.default_model", provider.id))
                    .with_source("selftest"),
            );
            entry.tests.push(log.record("model", Instant::now(), Err(err)));
            entry.finish(started);
            return entry;
        };
        entry.model = model.clone();

        let probe = ProviderProbe::new(
            adapter,
            endpoint,
            model,
            provider.request_defaults.clone(),
            self.options.probe_timeout,
            cancel.clone(),
        );
        entry.tests.push(log.probe("complete-text", || probe.complete_text()).await);
        entry.tests.push(log.probe("stream-text", || probe.stream_text()).await);
        entry.tests.push(log.probe("next-edit", || probe.task(TaskKind::NextEdit)).await);
        entry
            .tests
            .push(log.probe("next-edit-location", || probe.task(TaskKind::NextEditLocation)).await);
        entry.tests.push(log.probe("chat-stream", || probe.chat_stream()).await);

        if !tools.is_empty() {
            entry
                .tests
                .push(log.probe("real-tool-schema", || tool_probes::real_tool_schema(&probe, tools)).await);
            for (i, batch) in tools.chunks(ROUND_TRIP_BATCH_SIZE).enumerate() {
                let results = tool_probes::real_tool_round_trip(log, &probe, batch, i).await;
                entry.tests.extend(results);
            }
        }

        let t0 = Instant::now();
        let previous: Option<ToolTurn> = match probe.synthetic_tool().await {
            Ok((detail, turn)) => {
                entry.tests.push(log.record("synthetic-tool-multimodal", t0, Ok(detail)));
                Some(turn)
            }
            Err(e) => {
                entry.tests.push(log.record("synthetic-tool-multimodal", t0, Err(e)));
                None
            }
        };
        entry
            .tests
            .push(log.probe("tool-result-round-trip", || probe.tool_result_round_trip(previous)).await);

        entry.finish(started);
        entry
    }
}

fn cancelled_entry(log: &RunLog, provider: &ProviderConfig) -> SelfTestEntry {
    let started = Instant::now();
    let mut entry = SelfTestEntry::new(
        &provider.id,
        provider.provider_type.map_or("unknown", |t| t.as_str()),
    );
    entry.tests.push(log.record("config-check", started, Err(Error::Cancelled)));
    entry.finish(started);
    entry
}

/// Run the harness once with the given pieces.
pub async fn run_self_test(
    config: &BridgeConfig,
    transport: Arc<HttpTransport>,
    context: Arc<BridgeContext>,
    host: Option<Arc<dyn ToolHost>>,
    options: SelfTestOptions,
    cancel: CancellationToken,
) -> SelfTestReport {
    let mut harness = SelfTest::new(transport, context).with_options(options);
    if let Some(host) = host {
        harness = harness.with_host(host);
    }
    harness.run(config, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderType;

    fn harness() -> SelfTest {
        SelfTest::new(
            Arc::new(HttpTransport::with_client(reqwest::Client::new())),
            Arc::new(BridgeContext::new()),
        )
    }

    #[tokio::test]
    async fn test_invalid_provider_aborts_only_itself() {
        let mut broken = ProviderConfig::new("broken", ProviderType::OpenAiCompatible, "");
        broken.provider_type = None;
        let config = BridgeConfig {
            enabled: true,
            providers: vec![broken],
            ..Default::default()
        };
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let report = harness()
            .with_options(SelfTestOptions::default().with_log(tx))
            .run(&config, CancellationToken::new())
            .await;
        assert!(!report.ok);
        assert_eq!(report.providers.len(), 1);
        let entry = &report.providers[0];
        assert_eq!(entry.provider_type, "unknown");
        assert_eq!(entry.tests.len(), 1);
        assert_eq!(entry.tests[0].name, "config-check");
        assert!(!entry.tests[0].ok);
        assert_eq!(report.global.captured_tools, 0);
        assert!(rx.recv().await.unwrap().contains("started"));
    }

    #[tokio::test]
    async fn test_cancelled_run_marks_providers() {
        let config = BridgeConfig {
            enabled: true,
            providers: vec![ProviderConfig::new("p1", ProviderType::Anthropic, "https://a.example").with_api_key("k")],
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = harness().run(&config, cancel).await;
        assert!(!report.ok);
        assert_eq!(report.providers[0].tests[0].detail, "cancelled");
    }

    #[test]
    fn test_provider_filter() {
        let options = SelfTestOptions::default().with_providers(vec!["b".into()]);
        let a = ProviderConfig::new("a", ProviderType::Gemini, "https://g.example");
        let b = ProviderConfig::new("b", ProviderType::Gemini, "https://g.example");
        assert!(!options.selects(&a));
        assert!(options.selects(&b));
    }
}
