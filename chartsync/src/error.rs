use crate::id::{FrameId, NodeId, ObjectId, PaneScope, Scope};
use chartsync_integration::error::ChannelError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

/// Failure to construct or mutate the [`Watcher`](crate::watcher::Watcher) dependency graph.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum GraphError {
    #[error("wiring {input} into {node} would create a dependency cycle")]
    Cycle { node: NodeId, input: NodeId },

    #[error("unknown graph node: {0}")]
    UnknownNode(NodeId),

    #[error("node {node} still has dependents: {dependents:?}")]
    HasDependents {
        node: NodeId,
        dependents: Vec<NodeId>,
    },
}

/// Per-node recompute failure. Isolated to its node, which stays faulted until reset.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
#[error("node {node} ({label}) faulted in pass {pass}: {message}")]
pub struct NodeFault {
    pub node: NodeId,
    pub label: SmolStr,
    pub pass: u64,
    pub message: String,
}

/// Error returned by a user supplied indicator callback.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
#[error("{0}")]
pub struct IndicatorError(pub String);

impl From<&str> for IndicatorError {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for IndicatorError {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Error returned by a series history loader.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
#[error("{0}")]
pub struct HistoryError(pub String);

impl From<&str> for HistoryError {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for HistoryError {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Failure to allocate, resolve or retire a scoped identifier.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum IdentityError {
    #[error("unknown identity {id} in scope {scope}")]
    UnknownIdentity { scope: PaneScope, id: ObjectId },

    #[error("unknown identity scope: {0}")]
    UnknownScope(PaneScope),

    #[error("identity scope already open: {0}")]
    ScopeExists(PaneScope),

    #[error("identity {id} already registered in scope {scope}")]
    Occupied { scope: PaneScope, id: ObjectId },
}

/// Series ingestion failure. Logged and returned, never fatal to a pass.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum SeriesError {
    #[error("bar at {time} is not after the last stored bar at {last}")]
    OutOfOrder {
        time: DateTime<Utc>,
        last: DateTime<Utc>,
    },

    #[error("bar at {time} falls outside every session of the calendar")]
    OutsideSession { time: DateTime<Utc> },

    #[error("extended session bar at {time} rejected by a regular hours series")]
    ExtendedBarRejected { time: DateTime<Utc> },

    #[error("series interval must be positive, got {secs}s")]
    InvalidInterval { secs: i64 },
}

/// Outcome of an [`Emitter`](crate::emitter::Emitter) tracked task that did not succeed.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum TaskError {
    #[error("task {label} cancelled")]
    Cancelled { label: SmolStr },

    #[error("task {label} failed: {message}")]
    Failed { label: SmolStr, message: String },

    #[error("task {label} panicked: {message}")]
    Panicked { label: SmolStr, message: String },

    #[error("emitter closed to new tasks")]
    Closed,
}

/// Failure to mutate the frame and pane layout tree.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum LayoutError {
    #[error("unknown frame: {0}")]
    UnknownFrame(FrameId),

    #[error("unknown pane: {0}")]
    UnknownPane(PaneScope),

    #[error("frame {frame} layout requires {required} panes")]
    PaneRequired { frame: FrameId, required: usize },
}

/// All errors generated by the compute and presentation runtimes.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum SyncError {
    #[error("graph: {0}")]
    Graph(#[from] GraphError),

    #[error("identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("series: {0}")]
    Series(#[from] SeriesError),

    #[error("task: {0}")]
    Task(#[from] TaskError),

    #[error("layout: {0}")]
    Layout(#[from] LayoutError),

    #[error("channel: {0}")]
    Channel(#[from] ChannelError),

    #[error("{what} is not addressable at scope {scope}")]
    Misaddressed { what: SmolStr, scope: Scope },
}

impl SyncError {
    /// Determine if the error must stop the runtime that observed it.
    ///
    /// Only channel failures can be terminal: node faults, ingestion errors and identity
    /// misses are handled where they occur.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_terminal(&self) -> bool {
        match self {
            SyncError::Channel(error) => error.is_terminal(),
            _ => false,
        }
    }
}
