use crate::{
    config::AdapterConfig,
    error::{IdentityError, LayoutError, SyncError},
    id::{IdKind, ObjectId, PaneScope, Scope},
    identity::IdentityRegistry,
    layout::LayoutTree,
    primitive::Primitive,
    protocol::{Delta, Event, LayoutChange, ScopeLevel},
    watcher::Options,
};
use chartsync_integration::{ChannelReceiver, Envelope};
use smol_str::SmolStr;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Chart rendering collaborator driven by the [`PresentationAdapter`].
///
/// Only ever sees deltas that are in order, de-duplicated and addressed to live objects.
pub trait Renderer {
    fn apply(&mut self, scope: &Scope, delta: &Delta);

    /// Called once after every batch that applied at least one delta.
    fn flush(&mut self);
}

/// Summary of one [`PresentationAdapter::apply_pending`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ApplyReport {
    pub applied: usize,
    pub duplicates: usize,
    pub dropped: usize,
    /// Deltas still queued for the next frame boundary.
    pub remaining: usize,
}

/// Presentation side consumer of the forward channel.
///
/// Incoming deltas are queued without blocking and applied in batches on the renderer's
/// own frame boundary. The adapter mirrors the compute side layout and identities, so a
/// delta addressed to an identity that is no longer live (eg/ one racing a rescope) is
/// logged and dropped instead of reaching the renderer.
#[derive(Debug)]
pub struct PresentationAdapter<R> {
    config: AdapterConfig,
    renderer: R,
    registry: IdentityRegistry<IdKind>,
    layout: LayoutTree,
    pending: VecDeque<Envelope<Scope, Delta>>,
    last_applied: u64,
}

impl<R> PresentationAdapter<R>
where
    R: Renderer,
{
    pub fn new(config: AdapterConfig, renderer: R) -> Self {
        Self {
            config,
            renderer,
            registry: IdentityRegistry::new(),
            layout: LayoutTree::new(),
            pending: VecDeque::new(),
            last_applied: 0,
        }
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    pub fn layout(&self) -> &LayoutTree {
        &self.layout
    }

    pub fn registry(&self) -> &IdentityRegistry<IdKind> {
        &self.registry
    }

    /// Sequence number of the last delta taken off the queue.
    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Queue a delta for the next frame boundary. Never blocks.
    pub fn enqueue(&mut self, envelope: Envelope<Scope, Delta>) {
        self.pending.push_back(envelope);
    }

    /// Queue every delta the channel has ready, returning how many were queued.
    pub fn receive_ready(&mut self, receiver: &mut ChannelReceiver<Scope, Delta>) -> usize {
        let mut received = 0;
        while let Some(envelope) = receiver.try_recv() {
            self.enqueue(envelope);
            received += 1;
        }
        received
    }

    /// Apply up to `max_batch` queued deltas to the renderer, in sequence order.
    pub fn apply_pending(&mut self) -> ApplyReport {
        let mut report = ApplyReport::default();

        for _ in 0..self.config.max_batch {
            let Some(envelope) = self.pending.pop_front() else {
                break;
            };

            if envelope.seq <= self.last_applied {
                debug!(
                    seq = envelope.seq,
                    last_applied = self.last_applied,
                    "dropping duplicate delta"
                );
                report.duplicates += 1;
                continue;
            }
            self.last_applied = envelope.seq;

            match self.mirror(&envelope.scope, &envelope.payload) {
                Ok(()) => {
                    self.renderer.apply(&envelope.scope, &envelope.payload);
                    report.applied += 1;
                }
                Err(error) => {
                    warn!(
                        seq = envelope.seq,
                        scope = %envelope.scope,
                        delta = envelope.payload.name(),
                        %error,
                        "dropping unappliable delta"
                    );
                    report.dropped += 1;
                }
            }
        }

        if report.applied > 0 {
            self.renderer.flush();
        }
        report.remaining = self.pending.len();
        report
    }

    /// Reflect a delta in the layout and identity mirror.
    fn mirror(&mut self, scope: &Scope, delta: &Delta) -> Result<(), SyncError> {
        if ScopeLevel::of(scope) != delta.level() {
            return Err(misaddressed(delta.name(), scope));
        }

        match (scope, delta) {
            (Scope::Window, Delta::FrameAdd { frame }) => {
                for pane in frame.scopes() {
                    self.registry.open_scope(pane)?;
                }
                self.layout.insert_frame(frame.clone());
            }
            (Scope::Window, Delta::FrameRemove { frame }) => {
                let frame = self.layout.remove_frame(frame)?;
                for pane in frame.scopes() {
                    self.registry.close_scope(&pane)?;
                }
            }
            (Scope::Window, Delta::FrameOrder { frames }) => {
                self.layout.set_order(frames);
            }
            (Scope::Frame(frame), Delta::LayoutSet { layout }) => {
                for pane in self.layout.set_layout(frame, *layout)? {
                    self.registry.open_scope(PaneScope::new(frame.clone(), pane))?;
                }
            }
            (Scope::Frame(frame), Delta::PaneAdd { pane }) => {
                self.layout.insert_pane(frame, pane.clone())?;
                self.registry
                    .open_scope(PaneScope::new(frame.clone(), pane.clone()))?;
            }
            (Scope::Frame(frame), Delta::PaneRemove { pane }) => {
                let pane = PaneScope::new(frame.clone(), pane.clone());
                self.layout.detach_pane(&pane)?;
                self.registry.close_scope(&pane)?;
            }
            (Scope::Pane(pane), Delta::SeriesCreate { object_id, .. }) => {
                self.registry.affix(pane, object_id.clone(), IdKind::Series)?;
            }
            (Scope::Pane(pane), Delta::IndicatorCreate { object_id, .. }) => {
                self.registry
                    .affix(pane, object_id.clone(), IdKind::Indicator)?;
            }
            (Scope::Pane(pane), Delta::PrimitiveUpsert { object_id, .. }) => {
                if !self.registry.contains(pane, object_id) {
                    self.registry
                        .affix(pane, object_id.clone(), IdKind::Primitive)?;
                }
            }
            (
                Scope::Pane(pane),
                Delta::ObjectRemove { object_id } | Delta::PrimitiveRemove { object_id },
            ) => {
                self.registry.retire(pane, object_id)?;
            }
            (Scope::Pane(pane), delta) => {
                if let Some(object_id) = delta.object_id() {
                    self.registry.resolve(pane, object_id)?;
                }
            }
            (scope, delta) => return Err(misaddressed(delta.name(), scope)),
        }
        Ok(())
    }

    fn require_primitive(&self, scope: &PaneScope, id: &ObjectId) -> Result<(), SyncError> {
        self.require_kind(scope, id, IdKind::Primitive)
    }

    fn require_kind(&self, scope: &PaneScope, id: &ObjectId, kind: IdKind) -> Result<(), SyncError> {
        if self.registry.resolve(scope, id)? == kind {
            return Ok(());
        }
        Err(IdentityError::UnknownIdentity {
            scope: scope.clone(),
            id: id.clone(),
        }
        .into())
    }

    fn require_pane(&self, scope: &PaneScope) -> Result<(), SyncError> {
        if self.layout.contains_pane(scope) {
            Ok(())
        } else {
            Err(LayoutError::UnknownPane(scope.clone()).into())
        }
    }

    /// Build the event requesting a new primitive in `scope`. The compute side allocates
    /// its id and answers with a [`Delta::PrimitiveUpsert`].
    pub fn create_primitive(
        &self,
        scope: &PaneScope,
        primitive: Primitive,
    ) -> Result<(Scope, Event), SyncError> {
        self.require_pane(scope)?;
        Ok((scope.clone().into(), Event::PrimitiveCreate { primitive }))
    }

    pub fn move_primitive(
        &self,
        scope: &PaneScope,
        id: &ObjectId,
        to: &PaneScope,
    ) -> Result<(Scope, Event), SyncError> {
        self.require_primitive(scope, id)?;
        self.require_pane(to)?;
        Ok((
            scope.clone().into(),
            Event::PrimitiveMove {
                object_id: id.clone(),
                to: to.clone(),
            },
        ))
    }

    pub fn edit_primitive(
        &self,
        scope: &PaneScope,
        id: &ObjectId,
        primitive: Primitive,
    ) -> Result<(Scope, Event), SyncError> {
        self.require_primitive(scope, id)?;
        Ok((
            scope.clone().into(),
            Event::PrimitiveEdit {
                object_id: id.clone(),
                primitive,
            },
        ))
    }

    pub fn delete_primitive(
        &self,
        scope: &PaneScope,
        id: &ObjectId,
    ) -> Result<(Scope, Event), SyncError> {
        self.require_primitive(scope, id)?;
        Ok((
            scope.clone().into(),
            Event::PrimitiveDelete {
                object_id: id.clone(),
            },
        ))
    }

    /// Build the event switching a series to another symbol and/or interval. The compute
    /// side answers with a [`Delta::SeriesRetarget`] followed by the new history.
    pub fn change_series(
        &self,
        scope: &PaneScope,
        id: &ObjectId,
        symbol: Option<SmolStr>,
        interval_secs: Option<i64>,
    ) -> Result<(Scope, Event), SyncError> {
        self.require_kind(scope, id, IdKind::Series)?;
        Ok((
            scope.clone().into(),
            Event::SeriesChange {
                object_id: id.clone(),
                symbol,
                interval_secs,
            },
        ))
    }

    pub fn set_indicator_options(
        &self,
        scope: &PaneScope,
        id: &ObjectId,
        options: Options,
    ) -> Result<(Scope, Event), SyncError> {
        self.require_kind(scope, id, IdKind::Indicator)?;
        Ok((
            scope.clone().into(),
            Event::IndicatorOptions {
                object_id: id.clone(),
                options,
            },
        ))
    }

    /// Build a layout change event addressed at `scope`.
    pub fn change_layout(
        &self,
        scope: Scope,
        change: LayoutChange,
    ) -> Result<(Scope, Event), SyncError> {
        if ScopeLevel::of(&scope) != change.level() {
            return Err(misaddressed("layout_change", &scope));
        }

        match &scope {
            Scope::Window => {}
            Scope::Frame(frame) => {
                self.layout.frame(frame)?;
            }
            Scope::Pane(pane) => self.require_pane(pane)?,
        }
        Ok((scope, Event::LayoutChange { change }))
    }

    /// Build the event closing a surplus pane.
    pub fn close_pane(&self, scope: &PaneScope) -> Result<(Scope, Event), SyncError> {
        self.layout.can_remove_pane(scope)?;
        Ok((
            scope.clone().into(),
            Event::LayoutChange {
                change: LayoutChange::ClosePane,
            },
        ))
    }
}

fn misaddressed(what: &'static str, scope: &Scope) -> SyncError {
    SyncError::Misaddressed {
        what: SmolStr::new_static(what),
        scope: scope.clone(),
    }
}
