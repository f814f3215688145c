use derive_more::{Display, From};
use rand::{Rng, distr::Alphanumeric};
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, format_smolstr};

/// Length of the random suffix appended to a generated identifier.
pub const ID_SUFFIX_LEN: usize = 6;

/// Identifier of a [`Frame`](crate::layout::Frame), unique within the window.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, Display, From,
)]
#[serde(transparent)]
pub struct FrameId(pub SmolStr);

/// Identifier of a pane, unique within its owning [`Frame`](crate::layout::Frame).
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, Display, From,
)]
#[serde(transparent)]
pub struct PaneId(pub SmolStr);

/// Identifier of a series, indicator or primitive, unique within its owning pane only.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, Display, From,
)]
#[serde(transparent)]
pub struct ObjectId(pub SmolStr);

/// Key of a node in the [`Watcher`](crate::watcher::Watcher) dependency graph. Never
/// crosses the process boundary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, Display,
)]
#[display("n{_0}")]
pub struct NodeId(pub u64);

impl From<&str> for FrameId {
    fn from(value: &str) -> Self {
        Self(SmolStr::new(value))
    }
}

impl From<&str> for PaneId {
    fn from(value: &str) -> Self {
        Self(SmolStr::new(value))
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        Self(SmolStr::new(value))
    }
}

/// The scope an [`ObjectId`] is unique within: one pane of one frame.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, Display,
)]
#[display("{frame}/{pane}")]
pub struct PaneScope {
    pub frame: FrameId,
    pub pane: PaneId,
}

impl PaneScope {
    pub fn new(frame: impl Into<FrameId>, pane: impl Into<PaneId>) -> Self {
        Self {
            frame: frame.into(),
            pane: pane.into(),
        }
    }
}

/// Addressing level carried by every channel message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[display("window")]
    Window,
    #[display("{_0}")]
    Frame(FrameId),
    #[display("{_0}")]
    Pane(PaneScope),
}

impl Scope {
    /// Frame this scope belongs to, if any.
    pub fn frame(&self) -> Option<&FrameId> {
        match self {
            Scope::Window => None,
            Scope::Frame(frame) => Some(frame),
            Scope::Pane(scope) => Some(&scope.frame),
        }
    }

    pub fn pane(&self) -> Option<&PaneScope> {
        match self {
            Scope::Pane(scope) => Some(scope),
            _ => None,
        }
    }
}

impl From<PaneScope> for Scope {
    fn from(value: PaneScope) -> Self {
        Self::Pane(value)
    }
}

impl From<FrameId> for Scope {
    fn from(value: FrameId) -> Self {
        Self::Frame(value)
    }
}

/// Kind of addressable object, determining the prefix of its generated identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdKind {
    Frame,
    Pane,
    Series,
    Indicator,
    Primitive,
}

impl IdKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            IdKind::Frame => "f",
            IdKind::Pane => "p",
            IdKind::Series => "s",
            IdKind::Indicator => "i",
            IdKind::Primitive => "d",
        }
    }
}

/// Generate a `<prefix>_<suffix>` identifier, re-drawing the random suffix until `taken`
/// reports it free within the caller's scope.
pub fn generate_id(kind: IdKind, taken: impl Fn(&str) -> bool) -> SmolStr {
    let mut rng = rand::rng();
    loop {
        let suffix: String = (&mut rng)
            .sample_iter(Alphanumeric)
            .take(ID_SUFFIX_LEN)
            .map(char::from)
            .collect();

        let id = format_smolstr!("{}_{}", kind.prefix(), suffix);
        if !taken(&id) {
            return id;
        }
    }
}
