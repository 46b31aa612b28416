//! Self-test report types (camelCase JSON) and the probe recorder.

use std::future::Future;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::{Error, Result};

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestResult {
    pub name: String,
    pub ok: bool,
    pub ms: u64,
    pub detail: String,
}

impl TestResult {
    pub fn pass(name: impl Into<String>, ms: u64, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: true,
            ms,
            detail: detail.into(),
        }
    }

    pub fn fail(name: impl Into<String>, ms: u64, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: false,
            ms,
            detail: detail.into(),
        }
    }
}

/// Per-provider section of the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfTestEntry {
    pub provider_id: String,
    pub provider_type: String,
    pub model: String,
    pub tests: Vec<TestResult>,
    pub ok: bool,
    pub elapsed_ms: u64,
}

impl SelfTestEntry {
    pub fn new(provider_id: impl Into<String>, provider_type: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            provider_type: provider_type.into(),
            model: String::new(),
            tests: Vec::new(),
            ok: false,
            elapsed_ms: 0,
        }
    }

    pub(crate) fn finish(&mut self, started: Instant) {
        self.ok = !self.tests.is_empty() && self.tests.iter().all(|t| t.ok);
        self.elapsed_ms = started.elapsed().as_millis() as u64;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSection {
    pub tests: Vec<TestResult>,
    pub captured_tools: usize,
}

/// Complete report of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfTestReport {
    pub run_id: String,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub ok: bool,
    pub global: GlobalSection,
    pub providers: Vec<SelfTestEntry>,
}

impl SelfTestReport {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at_ms: now_ms(),
            finished_at_ms: 0,
            ok: false,
            global: GlobalSection::default(),
            providers: Vec::new(),
        }
    }

    /// `ok` iff every test of the global phase and of every provider passed.
    pub(crate) fn finish(&mut self) {
        self.finished_at_ms = now_ms();
        self.ok = self.global.tests.iter().all(|t| t.ok) && self.providers.iter().all(|p| p.ok);
    }

    pub fn failed_tests(&self) -> Vec<(&str, &TestResult)> {
        self.global
            .tests
            .iter()
            .map(|t| ("global", t))
            .chain(
                self.providers
                    .iter()
                    .flat_map(|p| p.tests.iter().map(move |t| (p.provider_id.as_str(), t))),
            )
            .filter(|(_, t)| !t.ok)
            .collect()
    }
}

/// Incremental log lines: `tracing` plus an optional channel to the host UI.
#[derive(Debug, Clone, Default)]
pub struct RunLog {
    tx: Option<UnboundedSender<String>>,
}

impl RunLog {
    pub fn new(tx: Option<UnboundedSender<String>>) -> Self {
        Self { tx }
    }

    pub fn line(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::info!(target: "byok_bridge::selftest", "{}", msg);
        if let Some(tx) = &self.tx {
            // Receiver gone: the host stopped listening, the run continues.
            let _ = tx.send(msg.to_string());
        }
    }

    /// Run a probe, downgrading its error into a failed [`TestResult`].
    pub async fn probe<F, Fut>(&self, name: &str, f: F) -> TestResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let started = Instant::now();
        let outcome = f().await;
        self.record(name, started, outcome)
    }

    /// Turn a finished probe outcome into a [`TestResult`] and log it.
    pub fn record(&self, name: &str, started: Instant, outcome: Result<String>) -> TestResult {
        let ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(detail) => TestResult::pass(name, ms, detail),
            Err(Error::Cancelled) => TestResult::fail(name, ms, "cancelled"),
            Err(e) => TestResult::fail(name, ms, e.to_string()),
        };
        self.line(format!(
            "[{}] {} ({} ms){}",
            if result.ok { "ok" } else { "FAIL" },
            result.name,
            result.ms,
            if result.detail.is_empty() {
                String::new()
            } else {
                format!(": {}", result.detail)
            }
        ));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_downgrades_errors() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let log = RunLog::new(Some(tx));
        let ok = log.probe("a", || async { Ok("fine".to_string()) }).await;
        let bad = log.probe("b", || async { Err(Error::runtime("boom")) }).await;
        let cancelled = log.probe("c", || async { Err(Error::Cancelled) }).await;
        assert!(ok.ok);
        assert!(!bad.ok && bad.detail.contains("boom"));
        assert_eq!(cancelled.detail, "cancelled");
        assert!(rx.recv().await.unwrap().starts_with("[ok] a"));
    }

    #[test]
    fn test_report_ok_requires_every_test() {
        let mut report = SelfTestReport::new("r1");
        let mut entry = SelfTestEntry::new("p1", "openai_compatible");
        entry.tests.push(TestResult::pass("x", 1, ""));
        entry.finish(Instant::now());
        report.providers.push(entry);
        report.finish();
        assert!(report.ok);

        report.global.tests.push(TestResult::fail("g", 1, "bad"));
        report.finish();
        assert!(!report.ok);
        assert_eq!(report.failed_tests().len(), 1);

        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("runId").is_some());
        assert!(json["global"].get("capturedTools").is_some());
        assert!(json["providers"][0].get("elapsedMs").is_some());
    }
}
