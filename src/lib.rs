//! # byok-bridge
//!
//! 自带密钥（BYOK）桥接层：按端点路由请求，并在规范代理协议与各家后端协议之间双向转换。
//!
//! Bring-your-own-key bridge for coding-agent clients. The client keeps speaking one
//! fixed canonical chat/completion protocol; per endpoint, a routing rule decides whether
//! the request goes to the official service, to a user-provided backend, or nowhere.
//!
//! ## Overview
//!
//! Requests routed to a user-provided backend are translated into one of four wire
//! formats (OpenAI chat-completions, OpenAI responses, Anthropic messages, Gemini
//! generateContent), and the backend's stream is reassembled into canonical chunks with
//! complete tool calls and one terminal stop reason. A self-test harness certifies a
//! configuration by exercising every backend through every translation path.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use byok_bridge::{Bridge, BridgeConfig};
//! use futures::StreamExt;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> byok_bridge::Result<()> {
//!     let config = BridgeConfig::from_path("byok.yaml")?;
//!     let bridge = Bridge::builder(config).build()?;
//!
//!     let body = serde_json::json!({"message": "Explain this function"});
//!     let route = bridge.route("/chat-stream", &body, true, CancellationToken::new()).await?;
//!     if route.is_byok() {
//!         let mut chunks = bridge.chat_stream(&route, &body, CancellationToken::new()).await?;
//!         while let Some(chunk) = chunks.next().await {
//!             println!("{:?}", chunk?);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`routing`] | Pure per-endpoint routing decision |
//! | [`normalize`] | Canonical request coercion, tool-schema dialects, message builders, task prompts |
//! | [`drivers`] | Backend drivers and the [`drivers::BackendAdapter`] |
//! | [`pipeline`] | SSE decoding, tool-call aggregation, deadlines and cancellation |
//! | [`client`] | [`Bridge`]: routing + translation front end for the host |
//! | [`compact`] | History compaction contract |
//! | [`selftest`] | Configuration self-test harness and report |
//! | [`config`] | Provider and routing configuration |
//! | [`context`] | Captured tool-definition set |
//! | [`host`] | Host tool-execution capability |
//! | [`transport`] | HTTP transport and credential redaction |
//! | [`types`] | Canonical protocol types |

pub mod client;
pub mod compact;
pub mod config;
pub mod context;
pub mod drivers;
pub mod host;
pub mod normalize;
pub mod pipeline;
pub mod routing;
pub mod selftest;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use client::{Bridge, BridgeBuilder};
pub use compact::{HistoryCompactor, NoopCompactor, SummarizingCompactor};
pub use config::{BridgeConfig, ProviderConfig, ProviderType};
pub use context::BridgeContext;
pub use drivers::BackendAdapter;
pub use host::{ToolHost, ToolOutcome};
pub use routing::{decide_route, Route, RouteMode};
pub use selftest::{SelfTest, SelfTestOptions, SelfTestReport};
pub use types::{
    CanonicalChatRequest, CanonicalResponseChunk, Message, MessageRole, RequestNode, ResponseNode, StopReason,
    StreamingEvent, ToolDef, ToolUseNode,
};

use futures::Stream;
use std::pin::Pin;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// A specialized Result for pipeline operations
pub type PipeResult<T> = std::result::Result<T, Error>;

/// A unified pinned, boxed stream that emits `PipeResult<T>`
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = PipeResult<T>> + Send + 'a>>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
