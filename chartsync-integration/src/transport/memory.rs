use super::TransportSink;
use crate::error::TransportError;
use async_trait::async_trait;
use futures::Stream;
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Outbound half of an in-memory transport.
#[derive(Debug)]
pub struct MemorySink {
    tx: Option<mpsc::Sender<String>>,
}

/// Inbound half of an in-memory transport.
#[derive(Debug)]
pub struct MemoryStream {
    inner: ReceiverStream<String>,
}

/// One end of an in-memory transport.
pub type MemoryEnd = (MemorySink, MemoryStream);

/// Construct two connected transport ends, each direction buffering up to `capacity` frames.
pub fn pair(capacity: usize) -> (MemoryEnd, MemoryEnd) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);

    (
        (MemorySink::new(a_tx), MemoryStream::new(a_rx)),
        (MemorySink::new(b_tx), MemoryStream::new(b_rx)),
    )
}

impl MemorySink {
    fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx: Some(tx) }
    }
}

impl MemoryStream {
    fn new(rx: mpsc::Receiver<String>) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
        }
    }
}

#[async_trait]
impl TransportSink for MemorySink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| TransportError::Closed("memory sink already closed".to_string()))?;

        tx.send(frame)
            .await
            .map_err(|_| TransportError::Closed("memory peer dropped".to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx.take();
        Ok(())
    }
}

impl Stream for MemoryStream {
    type Item = Result<String, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner)
            .poll_next(cx)
            .map(|frame| frame.map(Ok))
    }
}
