use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Time and price coordinate a primitive is pinned to.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct Anchor {
    pub time: DateTime<Utc>,
    pub price: f64,
}

impl Anchor {
    pub fn new(time: DateTime<Utc>, price: f64) -> Self {
        Self { time, price }
    }
}

/// User drawn annotation (eg/ a trend line), owned by exactly one pane at a time.
///
/// `kind` is an opaque type tag interpreted by the renderer; `style` holds renderer
/// specific attributes in insertion order.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Primitive {
    pub kind: SmolStr,
    pub anchors: Vec<Anchor>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub style: IndexMap<SmolStr, serde_json::Value>,
}

impl Primitive {
    pub fn new(kind: impl Into<SmolStr>, anchors: Vec<Anchor>) -> Self {
        Self {
            kind: kind.into(),
            anchors,
            style: IndexMap::new(),
        }
    }

    pub fn with_style(mut self, key: impl Into<SmolStr>, value: serde_json::Value) -> Self {
        self.style.insert(key.into(), value);
        self
    }
}
