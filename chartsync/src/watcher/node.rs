use crate::{
    error::{IndicatorError, NodeFault},
    id::{NodeId, ObjectId, PaneScope},
    series::Bar,
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use smol_str::SmolStr;
use std::sync::Arc;

/// Named indicator parameters (eg/ `period`), set by the user and read by the callback.
pub type Options = IndexMap<SmolStr, serde_json::Value>;

/// Single value of a flat indicator output. `None` marks a slot with no value yet (eg/ the
/// warm up period of a moving average).
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct Point {
    pub time: DateTime<Utc>,
    pub value: Option<f64>,
}

impl Point {
    pub fn new(time: DateTime<Utc>, value: Option<f64>) -> Self {
        Self { time, value }
    }
}

/// Output buffer of a graph node: series shaped or a flat value stream.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Output {
    #[default]
    Empty,
    Bars(Vec<Bar>),
    Values(Vec<Point>),
}

impl Output {
    pub fn len(&self) -> usize {
        match self {
            Output::Empty => 0,
            Output::Bars(bars) => bars.len(),
            Output::Values(points) => points.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last `n` elements.
    pub fn tail(&self, n: usize) -> Window<'_> {
        match self {
            Output::Empty => Window::Empty,
            Output::Bars(bars) => Window::Bars(&bars[bars.len().saturating_sub(n)..]),
            Output::Values(points) => Window::Values(&points[points.len().saturating_sub(n)..]),
        }
    }
}

/// Borrowed view over the tail of an [`Output`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Window<'a> {
    Empty,
    Bars(&'a [Bar]),
    Values(&'a [Point]),
}

impl Window<'_> {
    pub fn len(&self) -> usize {
        match self {
            Window::Empty => 0,
            Window::Bars(bars) => bars.len(),
            Window::Values(points) => points.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn times(&self) -> Vec<DateTime<Utc>> {
        match self {
            Window::Empty => vec![],
            Window::Bars(bars) => bars.iter().map(|bar| bar.time).collect(),
            Window::Values(points) => points.iter().map(|point| point.time).collect(),
        }
    }

    /// Close prices for bars, values for points.
    pub fn values(&self) -> Vec<Option<f64>> {
        match self {
            Window::Empty => vec![],
            Window::Bars(bars) => bars.iter().map(|bar| Some(bar.close)).collect(),
            Window::Values(points) => points.iter().map(|point| point.value).collect(),
        }
    }
}

/// Everything an indicator callback may look at during one recompute: the latest output of
/// each input, in wiring order, its own prior output and its current options.
#[derive(Debug, Clone)]
pub struct UpdateContext {
    pub pass: u64,
    pub node: NodeId,
    inputs: Vec<Arc<Output>>,
    prior: Arc<Output>,
    options: Arc<Options>,
}

impl UpdateContext {
    pub fn new(pass: u64, node: NodeId, inputs: Vec<Arc<Output>>, prior: Arc<Output>) -> Self {
        Self {
            pass,
            node,
            inputs,
            prior,
            options: Arc::default(),
        }
    }

    pub fn with_options(mut self, options: Arc<Options>) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Option `key` decoded as `T`; `None` if unset or of another shape.
    pub fn option<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.options
            .get(key)
            .and_then(|value| T::deserialize(value).ok())
    }

    pub fn inputs(&self) -> &[Arc<Output>] {
        &self.inputs
    }

    pub fn input(&self, index: usize) -> Option<&Output> {
        self.inputs.get(index).map(Arc::as_ref)
    }

    /// Last `n` elements of input `index`; empty if there is no such input.
    pub fn window(&self, index: usize, n: usize) -> Window<'_> {
        self.input(index)
            .map(|output| output.tail(n))
            .unwrap_or(Window::Empty)
    }

    pub fn prior(&self) -> &Output {
        &self.prior
    }
}

/// User supplied indicator computation.
///
/// Called with the current input window and prior output, returning the node's new output.
/// Any `Err` (or panic) faults only this node.
pub trait Indicator: Send {
    fn update(&mut self, ctx: &UpdateContext) -> Result<Output, IndicatorError>;
}

impl<F> Indicator for F
where
    F: FnMut(&UpdateContext) -> Result<Output, IndicatorError> + Send,
{
    fn update(&mut self, ctx: &UpdateContext) -> Result<Output, IndicatorError> {
        self(ctx)
    }
}

/// Indicator computation run on the blocking pool rather than inside the pass.
pub type OffloadJob =
    Arc<dyn Fn(&UpdateContext) -> Result<Output, IndicatorError> + Send + Sync + 'static>;

/// Addressable object a node publishes its output as.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Binding {
    pub scope: PaneScope,
    pub object_id: ObjectId,
}

impl Binding {
    pub fn new(scope: PaneScope, object_id: ObjectId) -> Self {
        Self { scope, object_id }
    }
}

pub(super) enum NodeKind {
    /// Output set from outside the graph (series snapshots).
    Source,
    /// Recomputed inline during a pass.
    Indicator(Box<dyn Indicator>),
    /// Recomputed on the blocking pool; results are folded back via
    /// [`Watcher::complete`](super::Watcher::complete).
    Offloaded { ticket: u64 },
}

impl std::fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Source => write!(f, "Source"),
            NodeKind::Indicator(_) => write!(f, "Indicator"),
            NodeKind::Offloaded { ticket } => write!(f, "Offloaded({ticket})"),
        }
    }
}

#[derive(Debug)]
pub(super) struct Node {
    pub label: SmolStr,
    pub kind: NodeKind,
    pub inputs: Vec<NodeId>,
    pub dependents: Vec<NodeId>,
    pub output: Arc<Output>,
    pub options: Arc<Options>,
    pub revision: u64,
    /// Input revisions observed by the last recompute, parallel to `inputs`.
    pub consumed: Vec<u64>,
    /// Set by notify, cleared when a pass visits the node.
    pub dirty: bool,
    /// Never computed, or reset since.
    pub stale: bool,
    /// Offloaded recompute dispatched and not yet folded back.
    pub pending: bool,
    pub fault: Option<NodeFault>,
    pub binding: Option<Binding>,
}

impl Node {
    pub fn new(label: SmolStr, kind: NodeKind) -> Self {
        let stale = !matches!(kind, NodeKind::Source);
        Self {
            label,
            kind,
            inputs: Vec::new(),
            dependents: Vec::new(),
            output: Arc::new(Output::Empty),
            options: Arc::default(),
            revision: 0,
            consumed: Vec::new(),
            dirty: stale,
            stale,
            pending: false,
            fault: None,
            binding: None,
        }
    }

    pub fn set_output(&mut self, output: Output) {
        self.output = Arc::new(output);
        self.revision += 1;
    }
}
