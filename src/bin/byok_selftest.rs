//! byok-selftest：对 BYOK 配置运行自检并输出 JSON 报告
//!
//! Usage:
//!   byok-selftest --config <file> [--provider <id>]... [--tools <file>] [--timeout-ms <n>] [--pretty]
//!
//! Exits with status 1 when any test failed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use byok_bridge::config::BridgeConfig;
use byok_bridge::context::BridgeContext;
use byok_bridge::normalize::normalize_tool_definition;
use byok_bridge::selftest::{SelfTest, SelfTestOptions};
use byok_bridge::transport::HttpTransport;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    providers: Vec<String>,
    tools: Option<PathBuf>,
    timeout_ms: Option<u64>,
    pretty: bool,
}

fn print_usage() {
    println!(
        r#"byok-selftest: BYOK 配置自检

USAGE:
    byok-selftest --config <file> [OPTIONS]

OPTIONS:
    --config <file>       Bridge configuration (YAML or JSON)
    --provider <id>       Only test this provider (repeatable)
    --tools <file>        JSON array of tool definitions to check and round-trip
    --timeout-ms <n>      Per-probe deadline in milliseconds (default 120000)
    --pretty              Pretty-print the report
    -h, --help            Show this help message

ENVIRONMENT:
    RUST_LOG              Log filter (default: info)"#
    );
}

fn parse_args(raw: &[String]) -> anyhow::Result<Option<Args>> {
    let mut args = Args::default();
    let mut iter = raw.iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .with_context(|| format!("{} needs a value", flag))
        };
        match arg.as_str() {
            "--config" => args.config = Some(PathBuf::from(value("--config")?)),
            "--provider" => args.providers.push(value("--provider")?),
            "--tools" => args.tools = Some(PathBuf::from(value("--tools")?)),
            "--timeout-ms" => {
                let raw = value("--timeout-ms")?;
                args.timeout_ms = Some(raw.parse().with_context(|| format!("invalid --timeout-ms: {}", raw))?);
            }
            "--pretty" => args.pretty = true,
            "-h" | "--help" => return Ok(None),
            other => bail!("unknown argument: {}", other),
        }
    }
    Ok(Some(args))
}

fn load_tools(path: &PathBuf) -> anyhow::Result<Vec<byok_bridge::ToolDef>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let raw: serde_json::Value = serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    let items = raw.as_array().context("tool file must hold a JSON array")?;
    Ok(items.iter().filter_map(normalize_tool_definition).collect())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let raw: Vec<String> = std::env::args().skip(1).collect();
    let Some(args) = parse_args(&raw)? else {
        print_usage();
        return Ok(());
    };
    let Some(config_path) = args.config.as_ref() else {
        print_usage();
        bail!("--config is required");
    };

    let config = BridgeConfig::from_path(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let context = Arc::new(BridgeContext::new());
    if let Some(path) = &args.tools {
        let tools = load_tools(path)?;
        context.capture(&tools, &path.display().to_string());
    }

    let mut options = SelfTestOptions::default();
    if !args.providers.is_empty() {
        options = options.with_providers(args.providers.clone());
    }
    if let Some(ms) = args.timeout_ms {
        options = options.with_probe_timeout(Duration::from_millis(ms));
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let harness = SelfTest::new(Arc::new(HttpTransport::new()?), context).with_options(options);
    let report = harness.run(&config, cancel).await;

    let out = if args.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", out);

    if !report.ok {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        let args = parse_args(&strings(&[
            "--config", "a.yaml", "--provider", "p1", "--provider", "p2", "--timeout-ms", "500", "--pretty",
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("a.yaml")));
        assert_eq!(args.providers, vec!["p1", "p2"]);
        assert_eq!(args.timeout_ms, Some(500));
        assert!(args.pretty);

        assert!(parse_args(&strings(&["--help"])).unwrap().is_none());
        assert!(parse_args(&strings(&["--bogus"])).is_err());
        assert!(parse_args(&strings(&["--config"])).is_err());
        assert!(parse_args(&strings(&["--timeout-ms", "soon"])).is_err());
    }
}
