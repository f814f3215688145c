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

//! # Chartsync
//! Data synchronisation core for multi-pane financial charts whose data is computed in one
//! process and rendered in another.
//!
//! ## Compute side
//! * [`Watcher`](watcher::Watcher): incremental recomputation of an indicator dependency
//!   graph, one topological pass at a time, with per-node failure isolation.
//! * [`Emitter`](emitter::Emitter): tracked asynchronous work with a shutdown drain barrier
//!   and per-pane cancellation.
//! * [`SeriesStore`](series::SeriesStore): session aware bar history with a whitespace tail.
//! * [`Workspace`](workspace::Workspace): owns all of the above plus the layout tree and
//!   identity registry, staging every change as a [`Delta`](protocol::Delta).
//!
//! ## Presentation side
//! * [`PresentationAdapter`](adapter::PresentationAdapter): applies ordered,
//!   de-duplicated deltas to a [`Renderer`](adapter::Renderer) on its own frame boundary,
//!   and builds user [`Event`](protocol::Event)s validated against its identity mirror.
//!
//! Both sides exchange messages over a forward channel from `chartsync-integration`, and
//! address objects by `(pane scope, id)` only: see [`IdentityRegistry`](identity::IdentityRegistry).

/// Frame, pane and object identifiers, scopes and id generation.
pub mod id;

/// All [`Error`](std::error::Error)s generated in Chartsync.
pub mod error;

/// Bar history, sessions and whitespace generation.
pub mod series;

/// Scoped identifier allocation, resolution and rescoping.
pub mod identity;

/// Indicator dependency graph and recomputation passes.
pub mod watcher;

/// Tracked task lifecycle and shutdown barrier.
pub mod emitter;

/// Frames, panes and their sub-layouts.
pub mod layout;

/// User drawn annotations.
pub mod primitive;

/// Deltas and events exchanged between the compute and presentation processes.
pub mod protocol;

/// Runtime configuration.
pub mod config;

/// Compute side runtime.
pub mod workspace;

/// Presentation side consumer.
pub mod adapter;

pub use adapter::{ApplyReport, PresentationAdapter, Renderer};
pub use config::{AdapterConfig, WorkspaceConfig};
pub use error::SyncError;
pub use id::{FrameId, ObjectId, PaneId, PaneScope, Scope};
pub use protocol::{Delta, Event, LayoutChange};
pub use workspace::{BarUpdate, Entity, HistoryLoader, HistoryRequest, Workspace};

// Dev dependency used by the integration tests only
#[cfg(test)]
use tracing_subscriber as _;
