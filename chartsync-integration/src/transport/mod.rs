use crate::error::TransportError;
use async_trait::async_trait;
use futures::Stream;

/// In-process transport backed by bounded tokio channels.
pub mod memory;

/// WebSocket transport backed by `tokio-tungstenite`.
pub mod ws;

/// Outbound half of a transport, moving one UTF-8 text frame at a time.
///
/// A returned [`TransportError::Transient`] tells the channel writer the same frame may be
/// retried. The frame may or may not have reached the peer, which is why the reading side
/// of a channel de-duplicates by sequence number.
#[async_trait]
pub trait TransportSink: Send + 'static {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Inbound half of a transport. Ends (`None`) when the peer releases the transport.
pub trait TransportStream:
    Stream<Item = Result<String, TransportError>> + Send + Unpin + 'static
{
}

impl<S> TransportStream for S where
    S: Stream<Item = Result<String, TransportError>> + Send + Unpin + 'static
{
}
