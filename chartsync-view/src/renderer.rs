use chartsync::{
    Delta, ObjectId, PaneScope, Renderer, Scope, series::SeriesChange, watcher::Output,
};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// What the view currently shows for one chart object.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectView {
    Series {
        symbol: String,
        bars: usize,
        whitespace: usize,
        last_close: Option<f64>,
    },
    Indicator {
        label: String,
        revision: u64,
        last_value: Option<f64>,
        fault: Option<String>,
    },
    Primitive {
        kind: String,
        anchors: usize,
    },
}

/// Headless [`Renderer`] that keeps a summary of every object on screen and logs it every
/// `summary_every` flushed batches.
#[derive(Debug)]
pub struct LogRenderer {
    frames: usize,
    objects: HashMap<(PaneScope, ObjectId), ObjectView>,
    flushes: u64,
    summary_every: u64,
}

impl LogRenderer {
    pub fn new(summary_every: u64) -> Self {
        Self {
            frames: 0,
            objects: HashMap::new(),
            flushes: 0,
            summary_every: summary_every.max(1),
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn object(&self, scope: &PaneScope, id: &ObjectId) -> Option<&ObjectView> {
        self.objects.get(&(scope.clone(), id.clone()))
    }

    pub fn objects(&self) -> impl Iterator<Item = (&PaneScope, &ObjectId, &ObjectView)> {
        self.objects.iter().map(|((scope, id), view)| (scope, id, view))
    }

    pub fn log_summary(&self) {
        info!(
            frames = self.frames,
            objects = self.objects.len(),
            "chart summary"
        );

        let mut objects: Vec<_> = self.objects().collect();
        objects.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        for (scope, id, view) in objects {
            match view {
                ObjectView::Series {
                    symbol,
                    bars,
                    whitespace,
                    last_close,
                } => info!(%scope, %id, symbol, bars, whitespace, ?last_close, "series"),
                ObjectView::Indicator {
                    label,
                    revision,
                    last_value,
                    fault: None,
                } => info!(%scope, %id, label, revision, ?last_value, "indicator"),
                ObjectView::Indicator {
                    label,
                    fault: Some(fault),
                    ..
                } => warn!(%scope, %id, label, fault, "indicator faulted"),
                ObjectView::Primitive { kind, anchors } => {
                    info!(%scope, %id, kind, anchors, "primitive")
                }
            }
        }
    }

    fn get_mut(&mut self, scope: &PaneScope, id: &ObjectId) -> Option<&mut ObjectView> {
        self.objects.get_mut(&(scope.clone(), id.clone()))
    }

    fn insert(&mut self, scope: &PaneScope, id: &ObjectId, view: ObjectView) {
        self.objects.insert((scope.clone(), id.clone()), view);
    }

    fn remove(&mut self, scope: &PaneScope, id: &ObjectId) {
        self.objects.remove(&(scope.clone(), id.clone()));
    }

    fn retain_outside(&mut self, inside: impl Fn(&PaneScope) -> bool) {
        self.objects.retain(|(scope, _), _| !inside(scope));
    }
}

impl Renderer for LogRenderer {
    fn apply(&mut self, scope: &Scope, delta: &Delta) {
        debug!(%scope, delta = delta.name(), "render");

        match (scope, delta) {
            (Scope::Window, Delta::FrameAdd { frame }) => {
                self.frames += 1;
                info!(frame = %frame.id, layout = ?frame.layout, "frame opened");
            }
            (Scope::Window, Delta::FrameRemove { frame }) => {
                self.frames = self.frames.saturating_sub(1);
                self.retain_outside(|scope| &scope.frame == frame);
                info!(%frame, "frame closed");
            }
            (Scope::Frame(frame), Delta::PaneRemove { pane }) => {
                self.retain_outside(|scope| &scope.frame == frame && &scope.pane == pane);
            }
            (
                Scope::Pane(pane),
                Delta::SeriesCreate {
                    object_id, symbol, ..
                },
            ) => self.insert(
                pane,
                object_id,
                ObjectView::Series {
                    symbol: symbol.to_string(),
                    bars: 0,
                    whitespace: 0,
                    last_close: None,
                },
            ),
            (
                Scope::Pane(pane),
                Delta::SeriesAppend {
                    object_id,
                    change,
                    bar,
                },
            ) => {
                if let Some(ObjectView::Series {
                    bars, last_close, ..
                }) = self.get_mut(pane, object_id)
                {
                    if !matches!(change, SeriesChange::Updated) {
                        *bars += 1;
                    }
                    *last_close = Some(bar.close);
                }
            }
            (Scope::Pane(pane), Delta::SeriesReset { object_id, bars }) => {
                if let Some(ObjectView::Series {
                    bars: count,
                    last_close,
                    ..
                }) = self.get_mut(pane, object_id)
                {
                    *count = bars.len();
                    *last_close = bars.last().map(|bar| bar.close);
                }
            }
            (
                Scope::Pane(pane),
                Delta::SeriesRetarget {
                    object_id, symbol, ..
                },
            ) => {
                if let Some(ObjectView::Series {
                    symbol: shown,
                    bars,
                    whitespace,
                    last_close,
                }) = self.get_mut(pane, object_id)
                {
                    *shown = symbol.to_string();
                    *bars = 0;
                    *whitespace = 0;
                    *last_close = None;
                }
            }
            (Scope::Pane(pane), Delta::Whitespace { object_id, times }) => {
                if let Some(ObjectView::Series { whitespace, .. }) = self.get_mut(pane, object_id) {
                    *whitespace = times.len();
                }
            }
            (
                Scope::Pane(pane),
                Delta::IndicatorCreate {
                    object_id, label, ..
                },
            ) => self.insert(
                pane,
                object_id,
                ObjectView::Indicator {
                    label: label.to_string(),
                    revision: 0,
                    last_value: None,
                    fault: None,
                },
            ),
            (
                Scope::Pane(pane),
                Delta::IndicatorUpdate {
                    object_id,
                    revision,
                    output,
                },
            ) => {
                if let Some(ObjectView::Indicator {
                    revision: shown,
                    last_value,
                    fault,
                    ..
                }) = self.get_mut(pane, object_id)
                {
                    *shown = *revision;
                    *last_value = latest(output);
                    *fault = None;
                }
            }
            (Scope::Pane(pane), Delta::IndicatorFault { object_id, message }) => {
                if let Some(ObjectView::Indicator { fault, .. }) = self.get_mut(pane, object_id) {
                    *fault = Some(message.clone());
                }
            }
            (
                Scope::Pane(pane),
                Delta::PrimitiveUpsert {
                    object_id,
                    primitive,
                },
            ) => self.insert(
                pane,
                object_id,
                ObjectView::Primitive {
                    kind: primitive.kind.to_string(),
                    anchors: primitive.anchors.len(),
                },
            ),
            (
                Scope::Pane(pane),
                Delta::ObjectRemove { object_id } | Delta::PrimitiveRemove { object_id },
            ) => self.remove(pane, object_id),
            _ => {}
        }
    }

    fn flush(&mut self) {
        self.flushes += 1;
        if self.flushes % self.summary_every == 0 {
            self.log_summary();
        }
    }
}

/// Most recent value of an indicator output, if it has one.
fn latest(output: &Output) -> Option<f64> {
    match output {
        Output::Empty => None,
        Output::Bars(bars) => bars.last().map(|bar| bar.close),
        Output::Values(points) => points.last().and_then(|point| point.value),
    }
}
