use crate::{
    error::LayoutError,
    id::{FrameId, IdKind, PaneId, PaneScope, generate_id},
};
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Arrangement of panes inside a frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    #[default]
    Single,
    DoubleVertical,
    DoubleHorizontal,
    TripleVertical,
    TripleHorizontal,
    /// One large pane on the left, two stacked on the right.
    TripleLeft,
    Quad,
}

impl Layout {
    /// Number of panes the layout needs.
    pub fn pane_count(&self) -> usize {
        match self {
            Layout::Single => 1,
            Layout::DoubleVertical | Layout::DoubleHorizontal => 2,
            Layout::TripleVertical | Layout::TripleHorizontal | Layout::TripleLeft => 3,
            Layout::Quad => 4,
        }
    }
}

/// Top level layout container.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Frame {
    pub id: FrameId,
    pub layout: Layout,
    pub panes: Vec<PaneId>,
}

impl Frame {
    pub fn scopes(&self) -> impl Iterator<Item = PaneScope> + '_ {
        self.panes
            .iter()
            .map(|pane| PaneScope::new(self.id.clone(), pane.clone()))
    }
}

/// Ordered frames of a window and the panes each frame owns.
///
/// Panes are only ever added implicitly: switching to a layout that needs more panes adds
/// them, switching to one that needs fewer keeps the surplus until each is explicitly
/// removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutTree {
    frames: IndexMap<FrameId, Frame>,
}

impl LayoutTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame(&self, frame: &FrameId) -> Result<&Frame, LayoutError> {
        self.frames
            .get(frame)
            .ok_or_else(|| LayoutError::UnknownFrame(frame.clone()))
    }

    fn frame_mut(&mut self, frame: &FrameId) -> Result<&mut Frame, LayoutError> {
        self.frames
            .get_mut(frame)
            .ok_or_else(|| LayoutError::UnknownFrame(frame.clone()))
    }

    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.values()
    }

    pub fn frame_ids(&self) -> Vec<FrameId> {
        self.frames.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn contains_pane(&self, scope: &PaneScope) -> bool {
        self.frames
            .get(&scope.frame)
            .is_some_and(|frame| frame.panes.contains(&scope.pane))
    }

    /// Create a frame with a generated id and as many panes as `layout` needs.
    pub fn add_frame(&mut self, layout: Layout) -> &Frame {
        let id = FrameId(generate_id(IdKind::Frame, |candidate| {
            self.frames.contains_key(&FrameId::from(candidate))
        }));

        let mut frame = Frame {
            id: id.clone(),
            layout,
            panes: Vec::with_capacity(layout.pane_count()),
        };
        while frame.panes.len() < layout.pane_count() {
            let pane = next_pane_id(&frame);
            frame.panes.push(pane);
        }

        self.frames.entry(id).or_insert(frame)
    }

    /// Insert a frame built elsewhere (eg/ mirrored from the compute process).
    pub fn insert_frame(&mut self, frame: Frame) {
        self.frames.insert(frame.id.clone(), frame);
    }

    /// Switch a frame's layout, returning the panes added to satisfy it.
    pub fn set_layout(
        &mut self,
        frame: &FrameId,
        layout: Layout,
    ) -> Result<Vec<PaneId>, LayoutError> {
        let entry = self.frame_mut(frame)?;
        entry.layout = layout;

        let mut added = Vec::new();
        while entry.panes.len() < layout.pane_count() {
            let pane = next_pane_id(entry);
            entry.panes.push(pane.clone());
            added.push(pane);
        }
        Ok(added)
    }

    /// Append a pane built elsewhere.
    pub fn insert_pane(&mut self, frame: &FrameId, pane: PaneId) -> Result<(), LayoutError> {
        let entry = self.frame_mut(frame)?;
        if !entry.panes.contains(&pane) {
            entry.panes.push(pane);
        }
        Ok(())
    }

    /// Check a pane may be removed without leaving its frame short of its layout.
    pub fn can_remove_pane(&self, scope: &PaneScope) -> Result<(), LayoutError> {
        let frame = self.frame(&scope.frame)?;
        if !frame.panes.contains(&scope.pane) {
            return Err(LayoutError::UnknownPane(scope.clone()));
        }

        let required = frame.layout.pane_count();
        if frame.panes.len() <= required {
            return Err(LayoutError::PaneRequired {
                frame: scope.frame.clone(),
                required,
            });
        }
        Ok(())
    }

    /// Remove a surplus pane.
    pub fn remove_pane(&mut self, scope: &PaneScope) -> Result<(), LayoutError> {
        self.can_remove_pane(scope)?;
        self.detach_pane(scope)
    }

    /// Remove a pane regardless of the frame layout.
    pub fn detach_pane(&mut self, scope: &PaneScope) -> Result<(), LayoutError> {
        let frame = self.frame_mut(&scope.frame)?;
        let index = frame
            .panes
            .iter()
            .position(|pane| pane == &scope.pane)
            .ok_or_else(|| LayoutError::UnknownPane(scope.clone()))?;
        frame.panes.remove(index);
        Ok(())
    }

    pub fn remove_frame(&mut self, frame: &FrameId) -> Result<Frame, LayoutError> {
        self.frames
            .shift_remove(frame)
            .ok_or_else(|| LayoutError::UnknownFrame(frame.clone()))
    }

    /// Move a frame to `index` (clamped), returning the new frame order.
    pub fn move_frame(
        &mut self,
        frame: &FrameId,
        index: usize,
    ) -> Result<Vec<FrameId>, LayoutError> {
        let from = self
            .frames
            .get_index_of(frame)
            .ok_or_else(|| LayoutError::UnknownFrame(frame.clone()))?;

        let to = index.min(self.frames.len().saturating_sub(1));
        self.frames.move_index(from, to);
        Ok(self.frame_ids())
    }

    /// Reorder frames to match `order`; frames missing from `order` keep their relative
    /// position after the listed ones.
    pub fn set_order(&mut self, order: &[FrameId]) {
        let mut placed = 0;
        for frame in order.iter().unique() {
            if let Some(from) = self.frames.get_index_of(frame) {
                self.frames.move_index(from, placed);
                placed += 1;
            }
        }
    }
}

fn next_pane_id(frame: &Frame) -> PaneId {
    PaneId(generate_id(IdKind::Pane, |candidate| {
        frame.panes.contains(&PaneId::from(candidate))
    }))
}
