//! Idle timeout wrapper for transport streams.
//!
//! Provides a stream wrapper that monitors idle time and yields a terminal
//! [`TransportError::Closed`] if no frame is received for a configurable period. This
//! detects a silently dead peer that never produces an explicit error.

use crate::error::TransportError;
use futures::Stream;
use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::Instant;

/// Default idle timeout for transport streams (2 minutes).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// A stream wrapper that fails the transport if no frame is received for the configured
/// timeout period.
#[derive(Debug)]
pub struct TimeoutStream<S> {
    inner: S,
    timeout_duration: Duration,
    deadline: Pin<Box<tokio::time::Sleep>>,
}

impl<S> TimeoutStream<S> {
    /// Create a new timeout stream wrapper with the specified timeout duration.
    pub fn new(inner: S, timeout_duration: Duration) -> Self {
        Self {
            inner,
            timeout_duration,
            deadline: Box::pin(tokio::time::sleep(timeout_duration)),
        }
    }
}

impl<S> Stream for TimeoutStream<S>
where
    S: Stream<Item = Result<String, TransportError>> + Unpin,
{
    type Item = Result<String, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let timeout_duration = self.timeout_duration;

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(item)) => {
                self.deadline.as_mut().reset(Instant::now() + timeout_duration);
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match self.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    tracing::warn!(
                        timeout_secs = timeout_duration.as_secs(),
                        "transport idle timeout - no frame received, failing transport"
                    );

                    // Reset so a caller that keeps polling is not failed again immediately
                    self.deadline.as_mut().reset(Instant::now() + timeout_duration);

                    Poll::Ready(Some(Err(TransportError::Closed(format!(
                        "no frame received for {}s",
                        timeout_duration.as_secs()
                    )))))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn test_idle_stream_fails_after_timeout() {
        let inner = futures::stream::pending::<Result<String, TransportError>>();
        let mut stream = TimeoutStream::new(inner, Duration::from_secs(5));

        let next = stream.next().await;

        assert!(matches!(next, Some(Err(TransportError::Closed(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_stream_passes_frames_through() {
        let inner = futures::stream::iter(vec![Ok("a".to_string()), Ok("b".to_string())]);
        let stream = TimeoutStream::new(inner, Duration::from_secs(5));

        let frames: Vec<_> = stream.collect().await;

        assert_eq!(frames, vec![Ok("a".to_string()), Ok("b".to_string())]);
    }
}
