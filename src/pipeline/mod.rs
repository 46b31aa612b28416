//! 流水线处理模块：把后端字节流还原为规范响应块。
//!
//! # Streaming Pipeline
//!
//! Turns a backend's raw byte stream into canonical response chunks.
//!
//! ```text
//! Raw Bytes → SseDecoder → driver frame parser → ChunkAggregator → CanonicalResponseChunk
//!     │            │               │                    │
//!   HTTP        SseFrame     StreamingEvent       text / tool_use /
//!                                                 usage + stop_reason
//! ```
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`decode`] | SSE framing (blank-line split, `data:` join, `[DONE]`) |
//! | [`aggregate`] | Tool-call state machine, one terminal chunk per turn |
//! | [`collect`] | Rebuild text/nodes/stop reason from a finished turn |
//! | [`guard`] | Deadline + cancellation token around every await |

pub mod aggregate;
pub mod collect;
pub mod decode;
pub mod guard;

use std::collections::VecDeque;

use futures::{stream, StreamExt};

use crate::types::{CanonicalResponseChunk, StreamingEvent, ToolDef};
use crate::BoxStream;

pub use aggregate::{ChunkAggregator, TurnState};
pub use collect::{collect_chunks, CollectedTurn};
pub use decode::{SseDecoder, SseFrame};
pub use guard::{guard_stream, CallGuard};

/// Pipeline error types
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Decoder error: {0}")]
    Decoder(String),

    /// In-band error event reported by the backend mid-stream.
    #[error("Upstream stream error: {0}")]
    Upstream(String),

    #[error("Malformed frame: {reason}{}", .hint.as_ref().map(|h| format!("\n💡 Hint: {}", h)).unwrap_or_default())]
    MalformedFrame { reason: String, hint: Option<String> },

    #[error("Stream ended in state {state}: {reason}")]
    UnexpectedEnd { state: String, reason: String },
}

impl PipelineError {
    /// Attach an actionable hint to the error
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        if let PipelineError::MalformedFrame { hint: ref mut h, .. } = self {
            *h = Some(hint.into());
        }
        self
    }
}

/// Drive a [`ChunkAggregator`] over an event stream.
///
/// The terminal chunk is emitted exactly once: on the backend's end event, or when the
/// event stream is exhausted without one (`end_turn` is synthesized). Errors end the
/// output stream after being yielded; in-band backend errors are scrubbed of `secrets`.
pub fn aggregate_stream(
    events: BoxStream<'static, StreamingEvent>,
    tools: &[ToolDef],
    secrets: Vec<String>,
) -> BoxStream<'static, CanonicalResponseChunk> {
    struct State {
        events: BoxStream<'static, StreamingEvent>,
        aggregator: ChunkAggregator,
        pending: VecDeque<CanonicalResponseChunk>,
        failed: bool,
    }

    let state = State {
        events,
        aggregator: ChunkAggregator::new(tools).with_secrets(secrets),
        pending: VecDeque::new(),
        failed: false,
    };

    let s = stream::unfold(state, |mut state| async move {
        loop {
            if let Some(chunk) = state.pending.pop_front() {
                return Some((Ok(chunk), state));
            }
            if state.failed || state.aggregator.is_done() {
                return None;
            }
            match state.events.next().await {
                Some(Ok(event)) => match state.aggregator.push(event) {
                    Ok(chunks) => state.pending.extend(chunks),
                    Err(e) => {
                        state.failed = true;
                        return Some((Err(e.into()), state));
                    }
                },
                Some(Err(e)) => {
                    state.failed = true;
                    return Some((Err(e), state));
                }
                None => state.pending.extend(state.aggregator.finish()),
            }
        }
    });
    Box::pin(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StopReason;

    #[tokio::test]
    async fn test_aggregate_stream_terminal_once() {
        let events: Vec<crate::Result<StreamingEvent>> = vec![
            Ok(StreamingEvent::text("a")),
            Ok(StreamingEvent::StreamEnd {
                finish_reason: Some("stop".into()),
            }),
            Ok(StreamingEvent::text("late")),
        ];
        let chunks: Vec<CanonicalResponseChunk> =
            aggregate_stream(Box::pin(stream::iter(events)), &[], Vec::new())
                .map(|r| r.unwrap())
                .collect()
                .await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].stop_reason, Some(StopReason::EndTurn));
    }

    #[tokio::test]
    async fn test_aggregate_stream_propagates_error() {
        let events: Vec<crate::Result<StreamingEvent>> = vec![
            Ok(StreamingEvent::text("a")),
            Err(crate::Error::Cancelled),
        ];
        let out: Vec<crate::Result<CanonicalResponseChunk>> =
            aggregate_stream(Box::pin(stream::iter(events)), &[], Vec::new()).collect().await;
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], Err(crate::Error::Cancelled)));
    }
}
