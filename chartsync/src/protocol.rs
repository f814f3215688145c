use crate::{
    id::{FrameId, ObjectId, PaneId, PaneScope, Scope},
    layout::{Frame, Layout},
    primitive::Primitive,
    series::{Bar, SeriesChange},
    watcher::{Options, Output},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Addressing level a message must be sent at.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeLevel {
    Window,
    Frame,
    Pane,
}

impl ScopeLevel {
    pub fn of(scope: &Scope) -> Self {
        match scope {
            Scope::Window => ScopeLevel::Window,
            Scope::Frame(_) => ScopeLevel::Frame,
            Scope::Pane(_) => ScopeLevel::Pane,
        }
    }
}

/// Incremental change forwarded from the compute process to the presentation process.
///
/// Frame deltas are sent at [`Scope::Window`], pane and layout deltas at the owning
/// [`Scope::Frame`], and object deltas at the owning [`Scope::Pane`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Delta {
    FrameAdd {
        frame: Frame,
    },
    FrameRemove {
        frame: FrameId,
    },
    FrameOrder {
        frames: Vec<FrameId>,
    },
    LayoutSet {
        layout: Layout,
    },
    PaneAdd {
        pane: PaneId,
    },
    PaneRemove {
        pane: PaneId,
    },
    SeriesCreate {
        object_id: ObjectId,
        symbol: SmolStr,
        interval_secs: i64,
        extended_hours: bool,
    },
    SeriesAppend {
        object_id: ObjectId,
        change: SeriesChange,
        bar: Bar,
    },
    SeriesReset {
        object_id: ObjectId,
        bars: Vec<Bar>,
    },
    /// Series switched symbol or interval; its history is cleared until the next reset.
    SeriesRetarget {
        object_id: ObjectId,
        symbol: SmolStr,
        interval_secs: i64,
    },
    Whitespace {
        object_id: ObjectId,
        times: Vec<DateTime<Utc>>,
    },
    IndicatorCreate {
        object_id: ObjectId,
        label: SmolStr,
        inputs: Vec<ObjectId>,
    },
    IndicatorUpdate {
        object_id: ObjectId,
        revision: u64,
        output: Output,
    },
    IndicatorFault {
        object_id: ObjectId,
        message: String,
    },
    /// Series or indicator destroyed.
    ObjectRemove {
        object_id: ObjectId,
    },
    PrimitiveUpsert {
        object_id: ObjectId,
        primitive: Primitive,
    },
    PrimitiveRemove {
        object_id: ObjectId,
    },
}

impl Delta {
    pub fn name(&self) -> &'static str {
        match self {
            Delta::FrameAdd { .. } => "frame_add",
            Delta::FrameRemove { .. } => "frame_remove",
            Delta::FrameOrder { .. } => "frame_order",
            Delta::LayoutSet { .. } => "layout_set",
            Delta::PaneAdd { .. } => "pane_add",
            Delta::PaneRemove { .. } => "pane_remove",
            Delta::SeriesCreate { .. } => "series_create",
            Delta::SeriesAppend { .. } => "series_append",
            Delta::SeriesReset { .. } => "series_reset",
            Delta::SeriesRetarget { .. } => "series_retarget",
            Delta::Whitespace { .. } => "whitespace",
            Delta::IndicatorCreate { .. } => "indicator_create",
            Delta::IndicatorUpdate { .. } => "indicator_update",
            Delta::IndicatorFault { .. } => "indicator_fault",
            Delta::ObjectRemove { .. } => "object_remove",
            Delta::PrimitiveUpsert { .. } => "primitive_upsert",
            Delta::PrimitiveRemove { .. } => "primitive_remove",
        }
    }

    /// Object the delta addresses, for object level deltas.
    pub fn object_id(&self) -> Option<&ObjectId> {
        match self {
            Delta::SeriesCreate { object_id, .. }
            | Delta::SeriesAppend { object_id, .. }
            | Delta::SeriesReset { object_id, .. }
            | Delta::SeriesRetarget { object_id, .. }
            | Delta::Whitespace { object_id, .. }
            | Delta::IndicatorCreate { object_id, .. }
            | Delta::IndicatorUpdate { object_id, .. }
            | Delta::IndicatorFault { object_id, .. }
            | Delta::ObjectRemove { object_id }
            | Delta::PrimitiveUpsert { object_id, .. }
            | Delta::PrimitiveRemove { object_id } => Some(object_id),
            _ => None,
        }
    }

    pub fn level(&self) -> ScopeLevel {
        match self {
            Delta::FrameAdd { .. } | Delta::FrameRemove { .. } | Delta::FrameOrder { .. } => {
                ScopeLevel::Window
            }
            Delta::LayoutSet { .. } | Delta::PaneAdd { .. } | Delta::PaneRemove { .. } => {
                ScopeLevel::Frame
            }
            _ => ScopeLevel::Pane,
        }
    }
}

/// Layout restructuring requested by the user.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayoutChange {
    /// Sent at [`Scope::Window`].
    AddFrame { layout: Layout },
    /// Sent at the frame's [`Scope::Frame`].
    SetLayout { layout: Layout },
    /// Sent at the frame's [`Scope::Frame`].
    CloseFrame,
    /// Sent at the frame's [`Scope::Frame`].
    MoveFrame { index: usize },
    /// Sent at the pane's [`Scope::Pane`].
    ClosePane,
}

impl LayoutChange {
    pub fn level(&self) -> ScopeLevel {
        match self {
            LayoutChange::AddFrame { .. } => ScopeLevel::Window,
            LayoutChange::SetLayout { .. }
            | LayoutChange::CloseFrame
            | LayoutChange::MoveFrame { .. } => ScopeLevel::Frame,
            LayoutChange::ClosePane => ScopeLevel::Pane,
        }
    }
}

/// User originated event forwarded from the presentation process to the compute process.
///
/// Primitive events are sent at the [`Scope::Pane`] currently owning the primitive (or, for
/// creation, the pane it is drawn in). Series and indicator events are sent at the pane
/// owning the object.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Event {
    PrimitiveCreate {
        primitive: Primitive,
    },
    PrimitiveMove {
        object_id: ObjectId,
        to: PaneScope,
    },
    PrimitiveEdit {
        object_id: ObjectId,
        primitive: Primitive,
    },
    PrimitiveDelete {
        object_id: ObjectId,
    },
    LayoutChange {
        change: LayoutChange,
    },
    /// Switch a series to another symbol and/or interval, reloading its history.
    SeriesChange {
        object_id: ObjectId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        symbol: Option<SmolStr>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval_secs: Option<i64>,
    },
    /// Replace an indicator's options, recomputing it from scratch.
    IndicatorOptions {
        object_id: ObjectId,
        options: Options,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::PrimitiveCreate { .. } => "primitive_create",
            Event::PrimitiveMove { .. } => "primitive_move",
            Event::PrimitiveEdit { .. } => "primitive_edit",
            Event::PrimitiveDelete { .. } => "primitive_delete",
            Event::LayoutChange { .. } => "layout_change",
            Event::SeriesChange { .. } => "series_change",
            Event::IndicatorOptions { .. } => "indicator_options",
        }
    }

    pub fn level(&self) -> ScopeLevel {
        match self {
            Event::LayoutChange { change } => change.level(),
            _ => ScopeLevel::Pane,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{primitive::Anchor, series::Session};
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_delta_wire_shape() {
        let time = Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap();
        let delta = Delta::SeriesAppend {
            object_id: ObjectId::from("s_aapl01"),
            change: SeriesChange::Inserted { index: 3 },
            bar: Bar::new(time, 1.0, 2.0, 0.5, 1.5, 100.0).with_session(Session::Extended),
        };

        let encoded = serde_json::to_value(&delta).unwrap();
        assert_eq!(encoded["kind"], json!("series_append"));
        assert_eq!(encoded["body"]["object_id"], json!("s_aapl01"));
        assert_eq!(encoded["body"]["change"], json!({ "type": "inserted", "index": 3 }));

        let decoded: Delta = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, delta);
    }

    #[test]
    fn test_series_change_wire_shape() {
        let event = Event::SeriesChange {
            object_id: ObjectId::from("s_aapl01"),
            symbol: None,
            interval_secs: Some(300),
        };

        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(
            encoded,
            json!({ "kind": "series_change", "body": { "object_id": "s_aapl01", "interval_secs": 300 } })
        );

        let decoded: Event = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_message_levels() {
        struct TestCase {
            level: ScopeLevel,
            expected: ScopeLevel,
        }

        let primitive = Primitive::new("ray", vec![Anchor::new(DateTime::<Utc>::UNIX_EPOCH, 1.0)]);
        let tests = vec![
            TestCase {
                // TC0: frame deltas address the window
                level: Delta::FrameOrder { frames: vec![] }.level(),
                expected: ScopeLevel::Window,
            },
            TestCase {
                // TC1: pane deltas address the owning frame
                level: Delta::PaneAdd {
                    pane: PaneId::from("p_a"),
                }
                .level(),
                expected: ScopeLevel::Frame,
            },
            TestCase {
                // TC2: object deltas address the owning pane
                level: Delta::PrimitiveUpsert {
                    object_id: ObjectId::from("d_a"),
                    primitive: primitive.clone(),
                }
                .level(),
                expected: ScopeLevel::Pane,
            },
            TestCase {
                // TC3: primitive events address the owning pane
                level: Event::PrimitiveCreate { primitive }.level(),
                expected: ScopeLevel::Pane,
            },
            TestCase {
                // TC4: adding a frame addresses the window
                level: Event::LayoutChange {
                    change: LayoutChange::AddFrame {
                        layout: Layout::Quad,
                    },
                }
                .level(),
                expected: ScopeLevel::Window,
            },
            TestCase {
                // TC5: closing a pane addresses the pane
                level: Event::LayoutChange {
                    change: LayoutChange::ClosePane,
                }
                .level(),
                expected: ScopeLevel::Pane,
            },
            TestCase {
                // TC6: indicator options address the owning pane
                level: Event::IndicatorOptions {
                    object_id: ObjectId::from("i_a"),
                    options: Options::new(),
                }
                .level(),
                expected: ScopeLevel::Pane,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(test.level, test.expected, "TC{} failed", index);
        }
    }
}
