//! Deadline and cancellation applied at every suspension point of a call.

use std::future::Future;
use std::time::Duration;

use futures::{stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{BoxStream, Error, Result};

/// Per-call deadline plus the caller's cancellation token.
#[derive(Debug, Clone)]
pub struct CallGuard {
    operation: String,
    timeout: Duration,
    deadline: Instant,
    cancel: CancellationToken,
}

impl CallGuard {
    /// The deadline starts counting now.
    pub fn new(operation: impl Into<String>, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            operation: operation.into(),
            timeout,
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn timeout_error(&self) -> Error {
        Error::timeout(self.operation.clone(), self.timeout.as_millis() as u64)
    }

    /// Fail fast if the caller already cancelled.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(self.timeout_error());
        }
        Ok(())
    }

    /// Await `fut` under the deadline and the token.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            res = tokio::time::timeout_at(self.deadline, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(self.timeout_error()),
            },
        }
    }

    /// Wrap a stream: each poll races the deadline and the token. The first error ends
    /// the stream.
    pub fn guard_stream<T: Send + 'static>(&self, input: BoxStream<'static, T>) -> BoxStream<'static, T> {
        let guard = self.clone();
        let s = stream::unfold(Some(input), move |state| {
            let guard = guard.clone();
            async move {
                let mut input = state?;
                let next = tokio::select! {
                    biased;
                    _ = guard.cancel.cancelled() => Some(Err(Error::Cancelled)),
                    res = tokio::time::timeout_at(guard.deadline, input.next()) => match res {
                        Ok(item) => item,
                        Err(_) => Some(Err(guard.timeout_error())),
                    },
                };
                match next {
                    Some(Ok(item)) => Some((Ok(item), Some(input))),
                    Some(Err(e)) => Some((Err(e), None)),
                    None => None,
                }
            }
        });
        Box::pin(s)
    }
}

/// Free-function form of [`CallGuard::guard_stream`].
pub fn guard_stream<T: Send + 'static>(input: BoxStream<'static, T>, guard: &CallGuard) -> BoxStream<'static, T> {
    guard.guard_stream(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancelled_stream_ends_with_cancelled() {
        let token = CancellationToken::new();
        let guard = CallGuard::new("chat-stream", Duration::from_secs(5), token.clone());
        let pending: BoxStream<'static, u32> = Box::pin(stream::pending());
        let mut guarded = guard.guard_stream(pending);
        token.cancel();
        let first = guarded.next().await.unwrap();
        assert!(matches!(first, Err(Error::Cancelled)));
        assert!(guarded.next().await.is_none());
    }

    #[tokio::test]
    async fn test_deadline_surfaces_timeout() {
        let guard = CallGuard::new("complete-text", Duration::from_millis(50), CancellationToken::new());
        let res: Result<()> = guard
            .run(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        match res {
            Err(Error::Timeout { operation, timeout_ms }) => {
                assert_eq!(operation, "complete-text");
                assert_eq!(timeout_ms, 50);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_items_pass_through() {
        let guard = CallGuard::new("x", Duration::from_secs(5), CancellationToken::new());
        let input: BoxStream<'static, u32> = Box::pin(stream::iter(vec![Ok(1), Ok(2)]));
        let items: Vec<u32> = guard
            .guard_stream(input)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(items, vec![1, 2]);
    }
}
