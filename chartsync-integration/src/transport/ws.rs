use super::TransportSink;
use crate::error::TransportError;
use async_trait::async_trait;
use futures::{
    SinkExt, Stream, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::{
    io::ErrorKind,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};
use tracing::debug;

/// Outbound half of a WebSocket transport. Frames are sent as `Message::Text`.
#[derive(Debug)]
pub struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

/// Inbound half of a WebSocket transport.
///
/// Ping/Pong frames are consumed silently (tungstenite answers pings itself) and a
/// `Close` frame ends the stream.
#[derive(Debug)]
pub struct WsStream<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

/// Split an established [`WebSocketStream`] into transport halves.
pub fn split<S>(websocket: WebSocketStream<S>) -> (WsSink<S>, WsStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = websocket.split();
    (WsSink { inner: sink }, WsStream { inner: stream })
}

#[async_trait]
impl<S> TransportSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(frame.into()))
            .await
            .map_err(transport_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await.map_err(transport_error)
    }
}

impl<S> Stream for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Item = Result<String, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let message = match self.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(message))) => message,
                Poll::Ready(Some(Err(error))) => {
                    return Poll::Ready(Some(Err(transport_error(error))));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            };

            match message {
                Message::Text(text) => return Poll::Ready(Some(Ok(text.as_str().to_owned()))),
                Message::Binary(bytes) => {
                    return Poll::Ready(Some(String::from_utf8(bytes.to_vec()).map_err(
                        |error| TransportError::Transient(format!("non utf-8 binary frame: {error}")),
                    )));
                }
                Message::Close(close_frame) => {
                    debug!(?close_frame, "WebSocket peer sent close frame");
                    return Poll::Ready(None);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }
}

/// Classify a tungstenite error as retryable or terminal for the transport.
pub fn transport_error(error: WsError) -> TransportError {
    match error {
        WsError::Io(io)
            if matches!(
                io.kind(),
                ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
            ) =>
        {
            TransportError::Transient(io.to_string())
        }
        WsError::WriteBufferFull(_) => {
            TransportError::Transient("WebSocket write buffer full".to_string())
        }
        other => TransportError::Closed(other.to_string()),
    }
}
