//! Rebuild a finished turn from its chunk sequence.

use futures::StreamExt;

use crate::types::{CanonicalResponseChunk, ResponseNode, StopReason, TokenUsageNode, ToolUseNode};
use crate::{BoxStream, Result};

/// Text, flat node list and final stop reason of a completed turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedTurn {
    pub text: String,
    pub nodes: Vec<ResponseNode>,
    pub stop_reason: Option<StopReason>,
    pub chunk_count: usize,
}

impl CollectedTurn {
    pub fn from_chunks(chunks: &[CanonicalResponseChunk]) -> Self {
        let mut turn = CollectedTurn::default();
        for chunk in chunks {
            turn.absorb(chunk.clone());
        }
        turn
    }

    fn absorb(&mut self, chunk: CanonicalResponseChunk) {
        self.chunk_count += 1;
        if let Some(text) = chunk.text {
            self.text.push_str(&text);
        }
        self.nodes.extend(chunk.nodes);
        if chunk.stop_reason.is_some() {
            self.stop_reason = chunk.stop_reason;
        }
    }

    pub fn tool_uses(&self) -> Vec<&ToolUseNode> {
        self.nodes.iter().filter_map(|n| n.as_tool_use()).collect()
    }

    pub fn usage(&self) -> Option<&TokenUsageNode> {
        self.nodes.iter().find_map(|n| match n {
            ResponseNode::TokenUsage(u) => Some(u),
            _ => None,
        })
    }
}

/// Drain a chunk stream; the first error aborts collection.
pub async fn collect_chunks(mut stream: BoxStream<'static, CanonicalResponseChunk>) -> Result<CollectedTurn> {
    let mut turn = CollectedTurn::default();
    while let Some(chunk) = stream.next().await {
        turn.absorb(chunk?);
    }
    Ok(turn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collect_rebuilds_turn() {
        let chunks = vec![
            CanonicalResponseChunk::text("Hello "),
            CanonicalResponseChunk::text("world"),
            CanonicalResponseChunk::node(ResponseNode::ToolUse(ToolUseNode::new("t1", "view", "{}"))),
            CanonicalResponseChunk::terminal(
                StopReason::ToolUseRequested,
                vec![ResponseNode::TokenUsage(TokenUsageNode {
                    input_tokens: 5,
                    output_tokens: 2,
                    cached_tokens: 0,
                })],
            ),
        ];
        let from_slice = CollectedTurn::from_chunks(&chunks);
        let stream: BoxStream<'static, CanonicalResponseChunk> =
            Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)));
        let turn = collect_chunks(stream).await.unwrap();
        assert_eq!(turn, from_slice);
        assert_eq!(turn.text, "Hello world");
        assert_eq!(turn.tool_uses().len(), 1);
        assert_eq!(turn.usage().unwrap().input_tokens, 5);
        assert_eq!(turn.stop_reason, Some(StopReason::ToolUseRequested));
    }
}
