//! History compaction before normalization.
//!
//! A compactor may shrink `chat_history` of a canonical request. The summarizing
//! implementation folds the oldest exchanges into one summary exchange and keeps the
//! recent tail verbatim, moving the cut earlier whenever it would separate a tool use
//! from the tool result that answers it.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::drivers::{BackendAdapter, ProviderEndpoint, TextCall};
use crate::types::{CanonicalChatRequest, Exchange, Message, RequestNode};
use crate::{Error, Result};

/// Pre-processing stage applied to a request before it reaches the normalizer.
#[async_trait]
pub trait HistoryCompactor: Send + Sync {
    async fn compact(&self, request: CanonicalChatRequest, cancel: &CancellationToken) -> Result<CanonicalChatRequest>;
}

/// Leaves every request untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCompactor;

#[async_trait]
impl HistoryCompactor for NoopCompactor {
    async fn compact(&self, request: CanonicalChatRequest, _cancel: &CancellationToken) -> Result<CanonicalChatRequest> {
        Ok(request)
    }
}

/// Produces a summary of a transcript.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &str, cancel: &CancellationToken) -> Result<String>;
}

/// When to compact and how much to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    /// Compact once history has more exchanges than this.
    pub max_exchanges: usize,
    /// Compact once history is larger than this many characters.
    pub max_chars: usize,
    /// Exchanges kept verbatim at the end of history.
    pub keep_recent: usize,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            max_exchanges: 40,
            max_chars: 200_000,
            keep_recent: 8,
        }
    }
}

impl CompactionPolicy {
    fn should_compact(&self, history: &[Exchange]) -> bool {
        history.len() > self.max_exchanges || history.iter().map(Exchange::char_len).sum::<usize>() > self.max_chars
    }
}

const SUMMARY_PREFIX: &str = "[Conversation summary]";

/// Summarizes the oldest part of history with a [`Summarizer`].
#[derive(Debug, Clone)]
pub struct SummarizingCompactor<S: Summarizer> {
    summarizer: S,
    policy: CompactionPolicy,
}

impl<S: Summarizer> SummarizingCompactor<S> {
    pub fn new(summarizer: S) -> Self {
        Self {
            summarizer,
            policy: CompactionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: CompactionPolicy) -> Self {
        self.policy = policy;
        self
    }
}

fn tool_result_ids<'a>(nodes: impl Iterator<Item = &'a RequestNode>) -> HashSet<&'a str> {
    nodes
        .filter_map(|n| match n {
            RequestNode::ToolResult(r) => Some(r.tool_use_id.as_str()),
            _ => None,
        })
        .collect()
}

/// Whether `answer_ids` answers any tool use of `prev`.
fn answers(prev: &Exchange, answer_ids: &HashSet<&str>) -> bool {
    prev.response_nodes
        .iter()
        .any(|u| answer_ids.contains(u.tool_use_id.as_str()))
}

/// Index of the first kept exchange. Exchanges before it are summarized.
fn split_point(request: &CanonicalChatRequest, keep_recent: usize) -> usize {
    let history = &request.chat_history;
    let mut split = history.len().saturating_sub(keep_recent);
    while split > 0 {
        let ids = if split == history.len() {
            tool_result_ids(request.current_nodes())
        } else {
            tool_result_ids(history[split].request_nodes.iter())
        };
        if !answers(&history[split - 1], &ids) {
            break;
        }
        split -= 1;
    }
    split
}

fn transcript(exchanges: &[Exchange]) -> String {
    let mut out = String::new();
    for e in exchanges {
        if !e.request_message.trim().is_empty() {
            out.push_str("User: ");
            out.push_str(e.request_message.trim());
            out.push('\n');
        }
        for node in &e.request_nodes {
            if let RequestNode::ToolResult(r) = node {
                out.push_str(&format!("Tool result ({}): {}\n", r.tool_use_id, r.content.trim()));
            }
        }
        if !e.response_text.trim().is_empty() {
            out.push_str("Assistant: ");
            out.push_str(e.response_text.trim());
            out.push('\n');
        }
        for u in &e.response_nodes {
            out.push_str(&format!("Assistant called {} with {}\n", u.tool_name, u.input_json));
        }
    }
    out
}

#[async_trait]
impl<S: Summarizer> HistoryCompactor for SummarizingCompactor<S> {
    async fn compact(&self, mut request: CanonicalChatRequest, cancel: &CancellationToken) -> Result<CanonicalChatRequest> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !self.policy.should_compact(&request.chat_history) {
            return Ok(request);
        }
        let split = split_point(&request, self.policy.keep_recent);
        if split == 0 {
            return Ok(request);
        }

        let summary = self
            .summarizer
            .summarize(&transcript(&request.chat_history[..split]), cancel)
            .await?;
        let kept = request.chat_history.split_off(split);
        tracing::debug!(
            summarized = split,
            kept = kept.len(),
            conversation_id = %request.conversation_id,
            "Compacted chat history"
        );
        let mut history = Vec::with_capacity(kept.len() + 1);
        history.push(Exchange::new(
            format!("{}\n{}", SUMMARY_PREFIX, summary.trim()),
            "Understood. I will continue from this summary.",
        ));
        history.extend(kept);
        request.chat_history = history;
        Ok(request)
    }
}

/// [`Summarizer`] backed by a backend's one-shot completion.
#[derive(Debug, Clone)]
pub struct AdapterSummarizer {
    adapter: BackendAdapter,
    endpoint: ProviderEndpoint,
    model: String,
    timeout: Duration,
}

impl AdapterSummarizer {
    pub fn new(adapter: BackendAdapter, endpoint: ProviderEndpoint, model: impl Into<String>) -> Self {
        Self {
            adapter,
            endpoint,
            model: model.into(),
            timeout: Duration::from_millis(60_000),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Summarizer for AdapterSummarizer {
    async fn summarize(&self, transcript: &str, cancel: &CancellationToken) -> Result<String> {
        let call = TextCall::new(self.endpoint.clone(), self.model.clone(), vec![Message::user(transcript)])
            .with_system_prompt(
                "Summarize this coding conversation for continuation. Keep file paths, decisions, \
                 open tasks and tool outcomes. Be concise.",
            )
            .with_timeout(self.timeout)
            .with_cancel(cancel.clone());
        self.adapter.complete_text(&call).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolUseNode;

    struct FixedSummarizer;

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, transcript: &str, _cancel: &CancellationToken) -> Result<String> {
            Ok(format!("{} lines", transcript.lines().count()))
        }
    }

    fn history(n: usize) -> Vec<Exchange> {
        (0..n).map(|i| Exchange::new(format!("q{}", i), format!("a{}", i))).collect()
    }

    fn policy(max_exchanges: usize, keep_recent: usize) -> CompactionPolicy {
        CompactionPolicy {
            max_exchanges,
            max_chars: usize::MAX,
            keep_recent,
        }
    }

    #[tokio::test]
    async fn test_below_threshold_is_untouched() {
        let mut request = CanonicalChatRequest::from_message("next");
        request.chat_history = history(3);
        let out = SummarizingCompactor::new(FixedSummarizer)
            .with_policy(policy(5, 2))
            .compact(request.clone(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, request);
    }

    #[tokio::test]
    async fn test_summary_replaces_head() {
        let mut request = CanonicalChatRequest::from_message("next");
        request.chat_history = history(10);
        let out = SummarizingCompactor::new(FixedSummarizer)
            .with_policy(policy(5, 3))
            .compact(request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.chat_history.len(), 4);
        assert!(out.chat_history[0].request_message.starts_with(SUMMARY_PREFIX));
        assert_eq!(out.chat_history[1].request_message, "q7");
    }

    #[tokio::test]
    async fn test_never_splits_tool_pair() {
        let mut h = history(6);
        h[2].response_nodes.push(ToolUseNode::new("t1", "view", "{}"));
        h[3].request_nodes.push(RequestNode::tool_result("t1", "ok"));
        let mut request = CanonicalChatRequest::from_message("next");
        request.chat_history = h;
        // keep_recent 3 would cut between exchange 2 (tool use) and 3 (its result)
        let out = SummarizingCompactor::new(FixedSummarizer)
            .with_policy(policy(4, 3))
            .compact(request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.chat_history.len(), 5);
        assert_eq!(out.chat_history[1].request_message, "q2");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = NoopCompactor
            .compact(CanonicalChatRequest::default(), &CancellationToken::new())
            .await;
        assert!(err.is_ok());
        let err = SummarizingCompactor::new(FixedSummarizer)
            .compact(CanonicalChatRequest::default(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
