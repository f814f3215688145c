use crate::{
    Payload,
    error::{ChannelError, TransportError},
    protocol::{Envelope, WireFrame},
    transport::{TransportSink, TransportStream},
};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tracing::{debug, error, info, warn};

/// Channel configuration.
pub mod config;

/// In-order, exactly-once release of sequenced frames.
pub mod sequence;

/// Launching the background tasks of an endpoint.
pub mod spawn;

use config::ChannelConfig;
use sequence::SequenceTracker;
use spawn::{LinkFuture, LinkTask, Spawner, TokioSpawner};

/// Open a channel endpoint over a transport.
///
/// Spawns the writer and reader tasks driving the transport and returns:
/// * a cloneable [`ChannelSender`] for outbound payloads,
/// * a [`ChannelReceiver`] yielding inbound payloads in order and without duplicates,
/// * a [`ChannelLink`] to observe or await the background tasks.
///
/// Dropping every [`ChannelSender`] clone closes the channel as if
/// [`ChannelSender::close`] had been called. Must be called from within a tokio runtime.
pub fn open<Scope, Out, In, Sink, Stream>(
    sink: Sink,
    stream: Stream,
    config: ChannelConfig,
) -> (
    ChannelSender<Scope, Out>,
    ChannelReceiver<Scope, In>,
    ChannelLink,
)
where
    Scope: Payload,
    Out: Payload,
    In: Payload,
    Sink: TransportSink,
    Stream: TransportStream,
{
    let endpoint = Endpoint::<Scope, Out, In>::new(sink, stream, config);
    let link = ChannelLink {
        writer: TokioSpawner::launch(endpoint.writer),
        reader: TokioSpawner::launch(endpoint.reader),
        shared: endpoint.shared,
    };
    (endpoint.sender, endpoint.receiver, link)
}

/// [`open`], launching the writer and reader through `spawner` as the labelled tasks
/// `channel:writer` and `channel:reader`.
pub fn open_with<Scope, Out, In, Sink, Stream>(
    sink: Sink,
    stream: Stream,
    config: ChannelConfig,
    spawner: &impl Spawner,
) -> Result<
    (
        ChannelSender<Scope, Out>,
        ChannelReceiver<Scope, In>,
        ChannelLink,
    ),
    ChannelError,
>
where
    Scope: Payload,
    Out: Payload,
    In: Payload,
    Sink: TransportSink,
    Stream: TransportStream,
{
    let endpoint = Endpoint::<Scope, Out, In>::new(sink, stream, config);

    let writer = spawner.spawn("channel:writer", endpoint.writer)?;
    let reader = match spawner.spawn("channel:reader", endpoint.reader) {
        Ok(reader) => reader,
        Err(error) => {
            endpoint.shared.fail(&error);
            writer.abort();
            return Err(error);
        }
    };

    let link = ChannelLink {
        writer,
        reader,
        shared: endpoint.shared,
    };
    Ok((endpoint.sender, endpoint.receiver, link))
}

/// Handles and background futures of an endpoint, before its tasks are launched.
struct Endpoint<Scope, Out, In> {
    sender: ChannelSender<Scope, Out>,
    receiver: ChannelReceiver<Scope, In>,
    writer: LinkFuture,
    reader: LinkFuture,
    shared: Arc<Shared>,
}

impl<Scope, Out, In> Endpoint<Scope, Out, In>
where
    Scope: Payload,
    Out: Payload,
    In: Payload,
{
    fn new<Sink, Stream>(sink: Sink, stream: Stream, config: ChannelConfig) -> Self
    where
        Sink: TransportSink,
        Stream: TransportStream,
    {
        let shared = Arc::new(Shared::default());
        let (queue_tx, queue_rx) = mpsc::channel(config.capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let writer = run_writer::<Scope, Out, Sink>(
            Writer {
                sink,
                config: config.clone(),
                next_seq: 1,
                shared: Arc::clone(&shared),
            },
            queue_rx,
            control_rx,
        )
        .boxed();

        let reader = run_reader::<Scope, In, Stream>(
            stream,
            inbound_tx,
            control_tx,
            Arc::clone(&shared),
            config.capacity,
        )
        .boxed();

        Self {
            sender: ChannelSender {
                tx: queue_tx,
                shared: Arc::clone(&shared),
                backpressure_limit: config.backpressure_limit,
            },
            receiver: ChannelReceiver { rx: inbound_rx },
            writer,
            reader,
            shared,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    closed: AtomicBool,
    sent: AtomicU64,
    acked: AtomicU64,
    /// First error that stopped the writer or reader.
    failure: Mutex<Option<ChannelError>>,
}

impl Shared {
    fn fail(&self, error: &ChannelError) {
        self.failure.lock().get_or_insert_with(|| error.clone());
        self.closed.store(true, Ordering::Release);
    }

    fn failure(&self) -> Option<ChannelError> {
        self.failure.lock().clone()
    }
}

#[derive(Debug)]
enum Outgoing<Scope, T> {
    Data { scope: Scope, payload: T },
    Close(oneshot::Sender<Result<(), ChannelError>>),
}

/// Signals from the reader task the writer must act on.
#[derive(Debug)]
enum Control {
    Ack(u64),
    PeerClose { last_seq: u64 },
    PeerCloseAck,
}

/// Producer handle of a channel. Cheap to clone; sequence numbers are assigned when the
/// writer dequeues, so all clones share one ordered stream.
#[derive(Debug)]
pub struct ChannelSender<Scope, T> {
    tx: mpsc::Sender<Outgoing<Scope, T>>,
    shared: Arc<Shared>,
    backpressure_limit: Duration,
}

impl<Scope, T> Clone for ChannelSender<Scope, T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
            backpressure_limit: self.backpressure_limit,
        }
    }
}

impl<Scope, T> ChannelSender<Scope, T> {
    /// Queue a payload for delivery.
    ///
    /// Suspends while the buffer is full. Fails with [`ChannelError::BackpressureExceeded`]
    /// if the buffer stays full past the configured limit, and with
    /// [`ChannelError::ChannelClosed`] once either side has closed the channel.
    pub async fn send(&self, scope: Scope, payload: T) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::ChannelClosed);
        }

        let item = match self.tx.try_send(Outgoing::Data { scope, payload }) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(ChannelError::ChannelClosed),
            Err(TrySendError::Full(item)) => item,
        };

        debug!("forward channel buffer full, producer waiting");
        match tokio::time::timeout(self.backpressure_limit, self.tx.send(item)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ChannelError::ChannelClosed),
            Err(_) => {
                let waited_ms = u64::try_from(self.backpressure_limit.as_millis()).unwrap_or(u64::MAX);
                error!(waited_ms, "forward channel backpressure limit exceeded");
                Err(ChannelError::BackpressureExceeded { waited_ms })
            }
        }
    }

    /// Perform the two-phase close: signal end-of-stream after every queued payload, wait
    /// for the peer's acknowledgement, then release the transport.
    ///
    /// Closing an already closed channel is a no-op, unless the link failed: then the
    /// error that stopped it is returned.
    pub async fn close(&self) -> Result<(), ChannelError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return self.shared.failure().map_or(Ok(()), Err);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Outgoing::Close(reply_tx)).await.is_err() {
            return Err(self.stopped());
        }

        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(self.stopped()),
        }
    }

    fn stopped(&self) -> ChannelError {
        self.shared.failure().unwrap_or(ChannelError::ChannelClosed)
    }

    /// True once either side has started closing, or the link has failed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

/// Consumer handle of a channel.
#[derive(Debug)]
pub struct ChannelReceiver<Scope, T> {
    rx: mpsc::Receiver<Envelope<Scope, T>>,
}

impl<Scope, T> ChannelReceiver<Scope, T> {
    /// Receive the next in-order envelope. Returns `None` once the channel has closed and
    /// every delivered envelope has been consumed.
    pub async fn recv(&mut self) -> Option<Envelope<Scope, T>> {
        self.rx.recv().await
    }

    /// Receive an envelope if one is ready, without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope<Scope, T>> {
        self.rx.try_recv().ok()
    }
}

/// Handle to the background tasks of a channel endpoint.
#[derive(Debug)]
pub struct ChannelLink {
    writer: LinkTask,
    reader: LinkTask,
    shared: Arc<Shared>,
}

impl ChannelLink {
    /// Highest sequence number written to the transport.
    pub fn sent(&self) -> u64 {
        self.shared.sent.load(Ordering::Acquire)
    }

    /// Highest sequence number the peer has acknowledged.
    pub fn acked(&self) -> u64 {
        self.shared.acked.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.writer.is_finished()
    }

    /// Wait for the writer to finish, then stop the reader.
    ///
    /// By the time the writer has finished a close handshake the reader has already handed
    /// every frame preceding the peer's acknowledgement to the [`ChannelReceiver`].
    pub async fn join(self) -> Result<(), ChannelError> {
        let Self { writer, reader, .. } = self;
        let writer = writer.join().await;

        if !reader.is_finished() {
            reader.abort();
        }
        let reader = reader.join().await;

        writer.and(reader)
    }

    /// Abort both background tasks without a close handshake.
    pub fn abort(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.writer.abort();
        self.reader.abort();
    }
}

#[derive(Debug)]
struct Writer<Sink> {
    sink: Sink,
    config: ChannelConfig,
    next_seq: u64,
    shared: Arc<Shared>,
}

async fn run_writer<Scope, T, Sink>(
    mut writer: Writer<Sink>,
    mut queue: mpsc::Receiver<Outgoing<Scope, T>>,
    mut control: mpsc::UnboundedReceiver<Control>,
) -> Result<(), ChannelError>
where
    Scope: Payload,
    T: Payload,
    Sink: TransportSink,
{
    let result = writer.run(&mut queue, &mut control).await;

    if let Err(error) = &result {
        writer.shared.fail(error);
    }
    writer.shared.closed.store(true, Ordering::Release);
    queue.close();

    let mut unsent = 0usize;
    while let Ok(outgoing) = queue.try_recv() {
        match outgoing {
            Outgoing::Data { .. } => unsent += 1,
            Outgoing::Close(reply) => {
                let _ = reply.send(result.clone());
            }
        }
    }
    if unsent > 0 {
        warn!(unsent, "forward channel released with frames still queued");
    }

    if let Err(error) = &result {
        error!(%error, terminal = error.is_terminal(), "forward channel writer stopped");
    }
    result
}

impl<Sink> Writer<Sink>
where
    Sink: TransportSink,
{
    async fn run<Scope, T>(
        &mut self,
        queue: &mut mpsc::Receiver<Outgoing<Scope, T>>,
        control: &mut mpsc::UnboundedReceiver<Control>,
    ) -> Result<(), ChannelError>
    where
        Scope: Payload,
        T: Payload,
    {
        loop {
            tokio::select! {
                biased;

                Some(signal) = control.recv() => match signal {
                    Control::Ack(seq) => {
                        self.send_frame(&WireFrame::<Scope, T>::Ack { seq }).await?;
                    }
                    Control::PeerClose { last_seq } => {
                        info!(last_seq, "peer closed forward channel, acknowledging");
                        self.send_frame(&WireFrame::<Scope, T>::CloseAck { last_seq }).await?;
                        self.release().await;
                        return Ok(());
                    }
                    Control::PeerCloseAck => {
                        debug!("ignoring CloseAck received outside a close handshake");
                    }
                },

                outgoing = queue.recv() => match outgoing {
                    Some(Outgoing::Data { scope, payload }) => {
                        let seq = self.next_seq;
                        self.send_frame(&WireFrame::Data(Envelope::new(seq, scope, payload)))
                            .await?;
                        self.next_seq += 1;
                        self.shared.sent.store(seq, Ordering::Release);
                    }
                    Some(Outgoing::Close(reply)) => {
                        let result = self.close_handshake::<Scope, T>(control).await;
                        let _ = reply.send(result.clone());
                        return result;
                    }
                    None => return self.close_handshake::<Scope, T>(control).await,
                },
            }
        }
    }

    async fn close_handshake<Scope, T>(
        &mut self,
        control: &mut mpsc::UnboundedReceiver<Control>,
    ) -> Result<(), ChannelError>
    where
        Scope: Payload,
        T: Payload,
    {
        self.shared.closed.store(true, Ordering::Release);

        let last_seq = self.next_seq - 1;
        info!(last_seq, "closing forward channel");
        self.send_frame(&WireFrame::<Scope, T>::Close { last_seq })
            .await?;

        let acknowledged = tokio::time::timeout(
            self.config.close_timeout,
            self.await_close_ack::<Scope, T>(control),
        )
        .await;

        self.release().await;

        match acknowledged {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    timeout_ms = self.config.close_timeout.as_millis() as u64,
                    "peer did not acknowledge close"
                );
                Err(ChannelError::CloseTimeout)
            }
        }
    }

    async fn await_close_ack<Scope, T>(
        &mut self,
        control: &mut mpsc::UnboundedReceiver<Control>,
    ) -> Result<(), ChannelError>
    where
        Scope: Payload,
        T: Payload,
    {
        loop {
            match control.recv().await {
                Some(Control::PeerCloseAck) => return Ok(()),
                Some(Control::PeerClose { last_seq }) => {
                    // Both sides closed at once
                    self.send_frame(&WireFrame::<Scope, T>::CloseAck { last_seq })
                        .await?;
                    return Ok(());
                }
                Some(Control::Ack(seq)) => {
                    self.send_frame(&WireFrame::<Scope, T>::Ack { seq }).await?;
                }
                None => {
                    return Err(ChannelError::Transport(TransportError::Closed(
                        "peer released transport before acknowledging close".to_string(),
                    )));
                }
            }
        }
    }

    async fn release(&mut self) {
        if let Err(error) = self.sink.close().await {
            debug!(%error, "failed to close transport sink");
        }
    }

    async fn send_frame<Scope, T>(
        &mut self,
        frame: &WireFrame<Scope, T>,
    ) -> Result<(), ChannelError>
    where
        Scope: Payload,
        T: Payload,
    {
        let text = serde_json::to_string(frame)?;
        self.send_with_retry(text).await
    }

    async fn send_with_retry(&mut self, text: String) -> Result<(), ChannelError> {
        let mut attempt = 0;
        loop {
            match self.sink.send(text.clone()).await {
                Ok(()) => return Ok(()),
                Err(error) if error.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_backoff(attempt);
                    attempt += 1;
                    warn!(attempt, ?delay, %error, "transient transport failure, re-sending frame");
                    tokio::time::sleep(delay).await;
                }
                Err(error) if error.is_transient() => {
                    return Err(ChannelError::Transport(TransportError::Closed(format!(
                        "retries exhausted: {error}"
                    ))));
                }
                Err(error) => return Err(ChannelError::Transport(error)),
            }
        }
    }
}

async fn run_reader<Scope, T, Stream>(
    mut stream: Stream,
    inbound: mpsc::Sender<Envelope<Scope, T>>,
    control: mpsc::UnboundedSender<Control>,
    shared: Arc<Shared>,
    capacity: usize,
) -> Result<(), ChannelError>
where
    Scope: Payload,
    T: Payload,
    Stream: TransportStream,
{
    let mut tracker = SequenceTracker::new(capacity);

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(text) => text,
            Err(error) if error.is_transient() => {
                warn!(%error, "transient transport read failure");
                continue;
            }
            Err(error) => {
                let error = ChannelError::Transport(error);
                shared.fail(&error);
                return Err(error);
            }
        };

        let frame = match serde_json::from_str::<WireFrame<Scope, T>>(&text) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "dropping undecodable channel frame");
                continue;
            }
        };

        match frame {
            WireFrame::Data(envelope) => {
                let before = tracker.delivered();
                let released = match tracker.accept(envelope.seq, envelope) {
                    Ok(released) => released,
                    Err(error) => {
                        error!(%error, "forward channel reader stopped");
                        shared.fail(&error);
                        return Err(error);
                    }
                };
                for ready in released {
                    if inbound.send(ready).await.is_err() {
                        debug!("channel receiver dropped, discarding inbound frame");
                    }
                }
                if tracker.delivered() > before {
                    let _ = control.send(Control::Ack(tracker.delivered()));
                }
            }
            WireFrame::Ack { seq } => {
                shared.acked.fetch_max(seq, Ordering::AcqRel);
            }
            WireFrame::Close { last_seq } => {
                shared.closed.store(true, Ordering::Release);
                if tracker.delivered() < last_seq {
                    warn!(
                        delivered = tracker.delivered(),
                        last_seq, "peer closed channel with frames undelivered"
                    );
                }
                let _ = control.send(Control::PeerClose {
                    last_seq: tracker.delivered(),
                });
                return Ok(());
            }
            WireFrame::CloseAck { last_seq } => {
                debug!(last_seq, "peer acknowledged close");
                let _ = control.send(Control::PeerCloseAck);
            }
        }
    }

    if shared.closed.load(Ordering::Acquire) {
        Ok(())
    } else {
        let error = ChannelError::Transport(TransportError::Closed(
            "transport ended without close handshake".to_string(),
        ));
        shared.fail(&error);
        Err(error)
    }
}
