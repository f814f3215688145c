#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::type_complexity)]

//! # Chartsync-Integration
//! Ordered, at-least-once forward channel between a compute process and a presentation
//! process.
//!
//! The channel is transport-agnostic: anything that can move UTF-8 text frames in both
//! directions can carry it (see [`transport`]). On top of the transport it provides:
//! * Per-channel sequence numbers assigned at dequeue time.
//! * A writer that retries transient failures, re-sending the same sequence number.
//! * A reader that drops duplicates and releases frames strictly in order.
//! * Bounded buffering with producer backpressure instead of dropping frames.
//! * A two-phase close handshake, after which sends fail with
//!   [`ChannelError::ChannelClosed`](error::ChannelError::ChannelClosed).

use serde::{Serialize, de::DeserializeOwned};

/// All [`Error`](std::error::Error)s generated by the forward channel and its transports.
pub mod error;

/// Wire framing shared by both ends of a channel.
pub mod protocol;

/// Channel endpoint: sender, receiver and the background link driving a transport.
pub mod channel;

/// Transport seam plus in-memory and WebSocket implementations.
pub mod transport;

/// Stream adapters applied to transport streams.
pub mod stream;

pub use channel::{
    ChannelLink, ChannelReceiver, ChannelSender,
    config::ChannelConfig,
    open, open_with,
    spawn::{LinkFuture, LinkTask, Spawner},
};
pub use protocol::{Envelope, WireFrame};

/// Bounds shared by every scope and payload type carried by a channel.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}
