use crate::{
    config::WorkspaceConfig,
    emitter::Emitter,
    error::{
        GraphError, HistoryError, IdentityError, IndicatorError, LayoutError, NodeFault,
        SeriesError, SyncError, TaskError,
    },
    id::{FrameId, IdKind, NodeId, ObjectId, PaneId, PaneScope, Scope},
    identity::IdentityRegistry,
    layout::{Layout, LayoutTree},
    primitive::Primitive,
    protocol::{Delta, Event, LayoutChange},
    series::{Bar, SeriesChange, SeriesStore, SessionCalendar},
    watcher::{
        Binding, Completed, Dispatch, Indicator, NodeUpdate, OffloadJob, Options, Output,
        PassReport, UpdateContext, Watcher, evaluate, panic_message,
    },
};
use chartsync_integration::{ChannelReceiver, ChannelSender, error::ChannelError};
use chrono::TimeDelta;
use fnv::FnvHashMap;
use smol_str::{SmolStr, format_smolstr};
use std::{
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tracing::{debug, info, warn};

/// Object an identity resolves to on the compute side.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Series(NodeId),
    Indicator(NodeId),
    Primitive(Primitive),
}

impl Entity {
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Entity::Series(node) | Entity::Indicator(node) => Some(*node),
            Entity::Primitive(_) => None,
        }
    }
}

/// Live bar from a market data source, addressed to a series.
#[derive(Debug, Clone, PartialEq)]
pub struct BarUpdate {
    pub scope: PaneScope,
    pub series: ObjectId,
    pub bar: Bar,
}

/// History fetch issued when a series changes symbol or interval.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRequest {
    pub scope: PaneScope,
    pub series: ObjectId,
    pub symbol: SmolStr,
    pub interval: TimeDelta,
}

/// Blocking source of series history, run on the blocking pool as a tracked task.
pub type HistoryLoader =
    Arc<dyn Fn(&HistoryRequest) -> Result<Vec<Bar>, HistoryError> + Send + Sync + 'static>;

#[derive(Debug)]
struct HistoryDelivery {
    node: NodeId,
    generation: u64,
    request: HistoryRequest,
    result: Result<Vec<Bar>, HistoryError>,
}

#[derive(Debug)]
struct OffloadCompletion {
    node: NodeId,
    ticket: u64,
    result: Result<Output, String>,
}

/// Compute side runtime: owns the layout, identities, dependency graph, tracked tasks and
/// series history of one presentation window, and stages every change as a [`Delta`] for
/// the forward channel.
///
/// All mutation happens on the task driving [`run`](Self::run) (or the caller's task in
/// tests), so a watcher pass always runs to completion before the next one starts.
#[derive(Debug)]
pub struct Workspace {
    config: WorkspaceConfig,
    layout: LayoutTree,
    registry: Arc<IdentityRegistry<Entity>>,
    watcher: Watcher,
    emitter: Emitter,
    stores: FnvHashMap<NodeId, SeriesStore>,
    offload_jobs: FnvHashMap<NodeId, OffloadJobEntry>,
    history: Option<HistoryLoaderEntry>,
    /// Latest retarget of each series; older history deliveries are dropped.
    retargets: FnvHashMap<NodeId, u64>,
    staged: Vec<(Scope, Delta)>,
    completions_tx: mpsc::UnboundedSender<OffloadCompletion>,
    completions_rx: mpsc::UnboundedReceiver<OffloadCompletion>,
    history_tx: mpsc::UnboundedSender<HistoryDelivery>,
    history_rx: mpsc::UnboundedReceiver<HistoryDelivery>,
    tx: ChannelSender<Scope, Delta>,
}

struct OffloadJobEntry(OffloadJob);

impl std::fmt::Debug for OffloadJobEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OffloadJob")
    }
}

struct HistoryLoaderEntry(HistoryLoader);

impl std::fmt::Debug for HistoryLoaderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HistoryLoader")
    }
}

impl Workspace {
    pub fn new(config: WorkspaceConfig, tx: ChannelSender<Scope, Delta>) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (history_tx, history_rx) = mpsc::unbounded_channel();
        Self {
            config,
            layout: LayoutTree::new(),
            registry: Arc::new(IdentityRegistry::new()),
            watcher: Watcher::new(),
            emitter: Emitter::new(),
            stores: FnvHashMap::default(),
            offload_jobs: FnvHashMap::default(),
            history: None,
            retargets: FnvHashMap::default(),
            staged: Vec::new(),
            completions_tx,
            completions_rx,
            history_tx,
            history_rx,
            tx,
        }
    }

    /// Fetch the history of changed series through `loader`.
    pub fn with_history_loader<F>(mut self, loader: F) -> Self
    where
        F: Fn(&HistoryRequest) -> Result<Vec<Bar>, HistoryError> + Send + Sync + 'static,
    {
        self.history = Some(HistoryLoaderEntry(Arc::new(loader)));
        self
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn layout(&self) -> &LayoutTree {
        &self.layout
    }

    /// Shared handle to the identity registry, safe to resolve from other tasks.
    pub fn registry(&self) -> Arc<IdentityRegistry<Entity>> {
        Arc::clone(&self.registry)
    }

    pub fn watcher(&self) -> &Watcher {
        &self.watcher
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    /// Deltas staged since the last [`flush`](Self::flush), in delivery order.
    pub fn staged(&self) -> &[(Scope, Delta)] {
        &self.staged
    }

    pub fn series(&self, scope: &PaneScope, id: &ObjectId) -> Result<&SeriesStore, SyncError> {
        let node = self.series_node(scope, id)?;
        self.stores
            .get(&node)
            .ok_or_else(|| unknown(scope, id).into())
    }

    pub fn primitive(&self, scope: &PaneScope, id: &ObjectId) -> Result<Primitive, SyncError> {
        match self.registry.resolve(scope, id)? {
            Entity::Primitive(primitive) => Ok(primitive),
            _ => Err(unknown(scope, id).into()),
        }
    }

    fn stage(&mut self, scope: impl Into<Scope>, delta: Delta) {
        let scope = scope.into();
        debug!(%scope, delta = delta.name(), "staged delta");
        self.staged.push((scope, delta));
    }

    /// Create a frame with the panes `layout` needs.
    pub fn add_frame(&mut self, layout: Layout) -> Result<FrameId, SyncError> {
        let frame = self.layout.add_frame(layout).clone();
        for scope in frame.scopes() {
            self.registry.open_scope(scope)?;
        }

        info!(frame = %frame.id, ?layout, panes = frame.panes.len(), "frame added");
        let id = frame.id.clone();
        self.stage(Scope::Window, Delta::FrameAdd { frame });
        Ok(id)
    }

    /// Switch a frame's layout, opening any panes it adds.
    pub fn set_layout(&mut self, frame: &FrameId, layout: Layout) -> Result<Vec<PaneId>, SyncError> {
        let added = self.layout.set_layout(frame, layout)?;

        // Panes first, so the mirror never has to invent panes for the new layout
        for pane in &added {
            self.registry
                .open_scope(PaneScope::new(frame.clone(), pane.clone()))?;
            self.stage(frame.clone(), Delta::PaneAdd { pane: pane.clone() });
        }
        self.stage(frame.clone(), Delta::LayoutSet { layout });

        info!(%frame, ?layout, added = added.len(), "frame layout set");
        Ok(added)
    }

    /// Close a pane the frame's layout no longer requires.
    ///
    /// Tracked tasks scoped to the pane are cancelled first, then its graph nodes are
    /// removed and its identities retired, and only then is the pane released.
    pub fn close_pane(&mut self, scope: &PaneScope) -> Result<(), SyncError> {
        self.layout.can_remove_pane(scope)?;
        self.teardown_pane(scope)?;
        self.layout.detach_pane(scope)?;

        self.stage(
            scope.frame.clone(),
            Delta::PaneRemove {
                pane: scope.pane.clone(),
            },
        );
        Ok(())
    }

    /// Close a frame and every pane it owns.
    pub fn close_frame(&mut self, frame: &FrameId) -> Result<(), SyncError> {
        let scopes: Vec<PaneScope> = self.layout.frame(frame)?.scopes().collect();
        for scope in &scopes {
            self.teardown_pane(scope)?;
        }
        self.layout.remove_frame(frame)?;

        info!(%frame, panes = scopes.len(), "frame closed");
        self.stage(Scope::Window, Delta::FrameRemove { frame: frame.clone() });
        Ok(())
    }

    fn teardown_pane(&mut self, scope: &PaneScope) -> Result<(), SyncError> {
        let cancelled = self.emitter.cancel_scope(scope);

        let removed = self.watcher.remove_scope(scope);
        for entry in &removed {
            self.stores.remove(&entry.node);
            self.offload_jobs.remove(&entry.node);
            self.retargets.remove(&entry.node);
        }

        let retired = self.registry.close_scope(scope)?;
        info!(
            %scope,
            cancelled,
            nodes = removed.len(),
            retired = retired.len(),
            "pane torn down"
        );
        Ok(())
    }

    /// Move a frame to `index`.
    pub fn reorder_frames(&mut self, frame: &FrameId, index: usize) -> Result<(), SyncError> {
        let frames = self.layout.move_frame(frame, index)?;
        self.stage(Scope::Window, Delta::FrameOrder { frames });
        Ok(())
    }

    /// Open a series for `symbol` in a pane.
    pub fn add_series(
        &mut self,
        scope: &PaneScope,
        symbol: impl Into<SmolStr>,
        interval: TimeDelta,
        extended_hours: bool,
    ) -> Result<ObjectId, SyncError> {
        if !self.layout.contains_pane(scope) {
            return Err(LayoutError::UnknownPane(scope.clone()).into());
        }

        let symbol = symbol.into();
        let node = self.watcher.register_source(symbol.clone());
        let id = match self
            .registry
            .allocate(scope, IdKind::Series, Entity::Series(node))
        {
            Ok(id) => id,
            Err(error) => {
                self.watcher.remove(node)?;
                return Err(error.into());
            }
        };
        self.watcher.bind(node, Binding::new(scope.clone(), id.clone()))?;

        let store = SeriesStore::new(symbol.clone(), interval, extended_hours)
            .with_whitespace_bars(self.config.whitespace_bars);
        self.stores.insert(node, store);

        info!(%scope, object_id = %id, %symbol, %node, "series added");
        self.stage(
            scope.clone(),
            Delta::SeriesCreate {
                object_id: id.clone(),
                symbol,
                interval_secs: interval.num_seconds(),
                extended_hours,
            },
        );
        Ok(id)
    }

    /// Destroy a series with no indicators attached.
    pub fn remove_series(&mut self, scope: &PaneScope, id: &ObjectId) -> Result<(), SyncError> {
        let node = self.series_node(scope, id)?;
        self.remove_node(scope, id, node)?;
        self.stores.remove(&node);
        self.retargets.remove(&node);
        Ok(())
    }

    /// Ingest a new bar. Ingestion failures are logged and returned, and leave the series
    /// and graph untouched.
    pub fn append_bar(
        &mut self,
        scope: &PaneScope,
        id: &ObjectId,
        bar: Bar,
    ) -> Result<SeriesChange, SyncError> {
        self.ingest(scope, id, bar, SeriesStore::append)
    }

    /// Ingest a bar, replacing a still forming last bar with the same time.
    pub fn upsert_bar(
        &mut self,
        scope: &PaneScope,
        id: &ObjectId,
        bar: Bar,
    ) -> Result<SeriesChange, SyncError> {
        self.ingest(scope, id, bar, SeriesStore::upsert)
    }

    fn ingest(
        &mut self,
        scope: &PaneScope,
        id: &ObjectId,
        bar: Bar,
        apply: fn(&mut SeriesStore, Bar) -> Result<SeriesChange, SeriesError>,
    ) -> Result<SeriesChange, SyncError> {
        let node = self.series_node(scope, id)?;
        let store = self
            .stores
            .get_mut(&node)
            .ok_or_else(|| unknown(scope, id))?;

        let tail_before = store.whitespace().first().copied();
        let change = match apply(store, bar) {
            Ok(change) => change,
            Err(error) => {
                warn!(%scope, object_id = %id, symbol = %store.symbol(), %error, "bar rejected");
                return Err(error.into());
            }
        };

        let stored = match change {
            SeriesChange::Inserted { index } => store.bars().get(index).copied(),
            SeriesChange::Appended | SeriesChange::Updated => store.last().copied(),
        }
        .unwrap_or(bar);

        let tail = (store.whitespace().first().copied() != tail_before)
            .then(|| store.whitespace().to_vec());
        let snapshot = Output::Bars(store.bars().to_vec());

        self.watcher.set_source(node, snapshot)?;
        self.stage(
            scope.clone(),
            Delta::SeriesAppend {
                object_id: id.clone(),
                change,
                bar: stored,
            },
        );
        if let Some(times) = tail {
            self.stage(
                scope.clone(),
                Delta::Whitespace {
                    object_id: id.clone(),
                    times,
                },
            );
        }
        Ok(change)
    }

    /// Replace a series' history (initial load).
    pub fn load_series(
        &mut self,
        scope: &PaneScope,
        id: &ObjectId,
        bars: Vec<Bar>,
    ) -> Result<(), SyncError> {
        let node = self.series_node(scope, id)?;
        let store = self
            .stores
            .get_mut(&node)
            .ok_or_else(|| unknown(scope, id))?;

        if let Err(error) = store.reset(bars) {
            warn!(%scope, object_id = %id, %error, "series load rejected");
            return Err(error.into());
        }

        let bars = store.bars().to_vec();
        let times = store.whitespace().to_vec();
        info!(%scope, object_id = %id, bars = bars.len(), "series loaded");

        self.watcher.set_source(node, Output::Bars(bars.clone()))?;
        self.stage(
            scope.clone(),
            Delta::SeriesReset {
                object_id: id.clone(),
                bars,
            },
        );
        if !times.is_empty() {
            self.stage(
                scope.clone(),
                Delta::Whitespace {
                    object_id: id.clone(),
                    times,
                },
            );
        }
        Ok(())
    }

    /// Switch a series to another symbol and/or interval; `None` keeps the current one.
    ///
    /// The history is cleared and every indicator downstream restarted. With a history
    /// loader configured the replacement history is fetched as a tracked task scoped to the
    /// pane and loaded once delivered. A later change supersedes an outstanding fetch.
    pub fn change_series(
        &mut self,
        scope: &PaneScope,
        id: &ObjectId,
        symbol: Option<SmolStr>,
        interval: Option<TimeDelta>,
    ) -> Result<(), SyncError> {
        let node = self.series_node(scope, id)?;
        let store = self
            .stores
            .get_mut(&node)
            .ok_or_else(|| unknown(scope, id))?;

        let symbol = symbol.unwrap_or_else(|| store.symbol().clone());
        let interval = interval.unwrap_or_else(|| store.interval());
        if let Err(error) = store.retarget(symbol.clone(), interval) {
            warn!(%scope, object_id = %id, %error, "series change rejected");
            return Err(error.into());
        }

        self.watcher.set_source(node, Output::Bars(Vec::new()))?;
        let restarted = self.watcher.restart(node)?;
        let generation = self.retargets.entry(node).or_default();
        *generation += 1;
        let generation = *generation;

        info!(
            %scope,
            object_id = %id,
            %symbol,
            interval_secs = interval.num_seconds(),
            restarted,
            "series changed"
        );
        self.stage(
            scope.clone(),
            Delta::SeriesRetarget {
                object_id: id.clone(),
                symbol: symbol.clone(),
                interval_secs: interval.num_seconds(),
            },
        );

        let request = HistoryRequest {
            scope: scope.clone(),
            series: id.clone(),
            symbol,
            interval,
        };
        self.request_history(node, generation, request)
    }

    fn request_history(
        &mut self,
        node: NodeId,
        generation: u64,
        request: HistoryRequest,
    ) -> Result<(), SyncError> {
        let Some(loader) = self.history.as_ref().map(|entry| Arc::clone(&entry.0)) else {
            debug!(scope = %request.scope, object_id = %request.series, "no history loader, series left empty");
            return Ok(());
        };
        let scope = Some(request.scope.clone());
        let symbol = request.symbol.clone();

        let fetch = {
            let request = request.clone();
            self.emitter
                .offload(format_smolstr!("history:{symbol}"), scope.clone(), move || {
                    catch_unwind(AssertUnwindSafe(|| loader(&request))).unwrap_or_else(|payload| {
                        Err(HistoryError(format!(
                            "panicked: {}",
                            panic_message(payload.as_ref())
                        )))
                    })
                })?
        };

        let deliveries = self.history_tx.clone();
        self.emitter
            .launch(format_smolstr!("deliver:history:{symbol}"), scope, async move {
                let result = match fetch.join().await {
                    Ok(result) => result,
                    Err(TaskError::Cancelled { .. }) => return Ok(()),
                    Err(error) => Err(HistoryError(error.to_string())),
                };
                deliveries
                    .send(HistoryDelivery {
                        node,
                        generation,
                        request,
                        result,
                    })
                    .map_err(|_| TaskError::Closed)
            })?;
        Ok(())
    }

    /// Load every history fetch delivered so far, returning how many were folded.
    pub fn collect_history(&mut self) -> usize {
        let mut folded = 0;
        while let Ok(delivery) = self.history_rx.try_recv() {
            self.fold_history(delivery);
            folded += 1;
        }
        folded
    }

    fn fold_history(&mut self, delivery: HistoryDelivery) {
        let HistoryDelivery {
            node,
            generation,
            request,
            result,
        } = delivery;

        if self.retargets.get(&node) != Some(&generation) {
            debug!(scope = %request.scope, object_id = %request.series, generation, "dropping superseded history");
            return;
        }

        match result {
            // Rejections are logged by load_series
            Ok(bars) => {
                let _ = self.load_series(&request.scope, &request.series, bars);
            }
            Err(error) => warn!(
                scope = %request.scope,
                object_id = %request.series,
                symbol = %request.symbol,
                %error,
                "history fetch failed"
            ),
        }
    }

    /// Adopt a session calendar for a series and regenerate its whitespace tail.
    pub fn set_calendar(
        &mut self,
        scope: &PaneScope,
        id: &ObjectId,
        calendar: &SessionCalendar,
    ) -> Result<(), SyncError> {
        let node = self.series_node(scope, id)?;
        let store = self
            .stores
            .get_mut(&node)
            .ok_or_else(|| unknown(scope, id))?;

        let revision = store.revision();
        let times = store.extend_whitespace(calendar).to_vec();
        if store.revision() != revision {
            self.stage(
                scope.clone(),
                Delta::Whitespace {
                    object_id: id.clone(),
                    times,
                },
            );
        }
        Ok(())
    }

    /// Attach an indicator computed inline during passes. `inputs` name series or
    /// indicators of the same pane.
    pub fn attach_indicator<I>(
        &mut self,
        scope: &PaneScope,
        label: impl Into<SmolStr>,
        inputs: &[ObjectId],
        indicator: I,
    ) -> Result<ObjectId, SyncError>
    where
        I: Indicator + 'static,
    {
        let label = label.into();
        let nodes = self.input_nodes(scope, inputs)?;
        let node = self.watcher.register(label.clone(), &nodes, indicator)?;
        self.bind_indicator(scope, node, label, inputs)
    }

    /// Attach an indicator whose recompute runs on the blocking pool as a tracked task.
    pub fn attach_offloaded<F>(
        &mut self,
        scope: &PaneScope,
        label: impl Into<SmolStr>,
        inputs: &[ObjectId],
        job: F,
    ) -> Result<ObjectId, SyncError>
    where
        F: Fn(&UpdateContext) -> Result<Output, IndicatorError> + Send + Sync + 'static,
    {
        let label = label.into();
        let nodes = self.input_nodes(scope, inputs)?;
        let node = self.watcher.register_offloaded(label.clone(), &nodes)?;
        self.offload_jobs.insert(node, OffloadJobEntry(Arc::new(job)));
        self.bind_indicator(scope, node, label, inputs)
    }

    fn bind_indicator(
        &mut self,
        scope: &PaneScope,
        node: NodeId,
        label: SmolStr,
        inputs: &[ObjectId],
    ) -> Result<ObjectId, SyncError> {
        let id = match self
            .registry
            .allocate(scope, IdKind::Indicator, Entity::Indicator(node))
        {
            Ok(id) => id,
            Err(error) => {
                self.watcher.remove(node)?;
                self.offload_jobs.remove(&node);
                return Err(error.into());
            }
        };
        self.watcher.bind(node, Binding::new(scope.clone(), id.clone()))?;

        info!(%scope, object_id = %id, %label, %node, "indicator attached");
        self.stage(
            scope.clone(),
            Delta::IndicatorCreate {
                object_id: id.clone(),
                label,
                inputs: inputs.to_vec(),
            },
        );
        Ok(id)
    }

    /// Detach an indicator nothing else consumes.
    pub fn detach_indicator(&mut self, scope: &PaneScope, id: &ObjectId) -> Result<(), SyncError> {
        let node = self.indicator_node(scope, id)?;
        self.remove_node(scope, id, node)?;
        self.offload_jobs.remove(&node);
        Ok(())
    }

    fn remove_node(&mut self, scope: &PaneScope, id: &ObjectId, node: NodeId) -> Result<(), SyncError> {
        self.watcher.remove(node)?;
        self.registry.retire(scope, id)?;
        self.stage(
            scope.clone(),
            Delta::ObjectRemove {
                object_id: id.clone(),
            },
        );
        Ok(())
    }

    /// Clear an indicator's fault so the next pass recomputes it.
    pub fn reset_indicator(&mut self, scope: &PaneScope, id: &ObjectId) -> Result<(), SyncError> {
        let node = self.indicator_node(scope, id)?;
        self.watcher.reset(node)?;
        Ok(())
    }

    /// Replace an indicator's options. It and everything downstream recompute from scratch
    /// on the next pass, with any fault cleared.
    pub fn set_indicator_options(
        &mut self,
        scope: &PaneScope,
        id: &ObjectId,
        options: Options,
    ) -> Result<(), SyncError> {
        let node = self.indicator_node(scope, id)?;
        debug!(%scope, object_id = %id, options = options.len(), "indicator options replaced");
        self.watcher.set_options(node, options)?;
        Ok(())
    }

    pub fn create_primitive(
        &mut self,
        scope: &PaneScope,
        primitive: Primitive,
    ) -> Result<ObjectId, SyncError> {
        let id = self.registry.allocate(
            scope,
            IdKind::Primitive,
            Entity::Primitive(primitive.clone()),
        )?;

        debug!(%scope, object_id = %id, kind = %primitive.kind, "primitive created");
        self.stage(
            scope.clone(),
            Delta::PrimitiveUpsert {
                object_id: id.clone(),
                primitive,
            },
        );
        Ok(id)
    }

    pub fn edit_primitive(
        &mut self,
        scope: &PaneScope,
        id: &ObjectId,
        primitive: Primitive,
    ) -> Result<(), SyncError> {
        let replaced = self.registry.update(scope, id, |entity| match entity {
            Entity::Primitive(current) => {
                *current = primitive.clone();
                true
            }
            _ => false,
        })?;
        if !replaced {
            return Err(unknown(scope, id).into());
        }

        self.stage(
            scope.clone(),
            Delta::PrimitiveUpsert {
                object_id: id.clone(),
                primitive,
            },
        );
        Ok(())
    }

    /// Move a primitive to another pane, re-scoping it under a new id.
    pub fn move_primitive(
        &mut self,
        scope: &PaneScope,
        id: &ObjectId,
        to: &PaneScope,
    ) -> Result<ObjectId, SyncError> {
        self.primitive(scope, id)?;
        let new_id = self.registry.rescope(scope, id, to, IdKind::Primitive)?;
        let primitive = self.primitive(to, &new_id)?;

        info!(from = %scope, %id, %to, %new_id, "primitive moved");
        self.stage(
            scope.clone(),
            Delta::PrimitiveRemove {
                object_id: id.clone(),
            },
        );
        self.stage(
            to.clone(),
            Delta::PrimitiveUpsert {
                object_id: new_id.clone(),
                primitive,
            },
        );
        Ok(new_id)
    }

    pub fn delete_primitive(&mut self, scope: &PaneScope, id: &ObjectId) -> Result<(), SyncError> {
        self.primitive(scope, id)?;
        self.registry.retire(scope, id)?;

        self.stage(
            scope.clone(),
            Delta::PrimitiveRemove {
                object_id: id.clone(),
            },
        );
        Ok(())
    }

    /// Apply a user originated event received at `scope`.
    pub fn handle_event(&mut self, scope: Scope, event: Event) -> Result<(), SyncError> {
        match (scope, event) {
            (Scope::Pane(pane), Event::PrimitiveCreate { primitive }) => {
                self.create_primitive(&pane, primitive).map(drop)
            }
            (Scope::Pane(pane), Event::PrimitiveMove { object_id, to }) => {
                self.move_primitive(&pane, &object_id, &to).map(drop)
            }
            (Scope::Pane(pane), Event::PrimitiveEdit { object_id, primitive }) => {
                self.edit_primitive(&pane, &object_id, primitive)
            }
            (Scope::Pane(pane), Event::PrimitiveDelete { object_id }) => {
                self.delete_primitive(&pane, &object_id)
            }
            (
                Scope::Window,
                Event::LayoutChange {
                    change: LayoutChange::AddFrame { layout },
                },
            ) => self.add_frame(layout).map(drop),
            (
                Scope::Frame(frame),
                Event::LayoutChange {
                    change: LayoutChange::SetLayout { layout },
                },
            ) => self.set_layout(&frame, layout).map(drop),
            (
                Scope::Frame(frame),
                Event::LayoutChange {
                    change: LayoutChange::CloseFrame,
                },
            ) => self.close_frame(&frame),
            (
                Scope::Frame(frame),
                Event::LayoutChange {
                    change: LayoutChange::MoveFrame { index },
                },
            ) => self.reorder_frames(&frame, index),
            (
                Scope::Pane(pane),
                Event::LayoutChange {
                    change: LayoutChange::ClosePane,
                },
            ) => self.close_pane(&pane),
            (
                Scope::Pane(pane),
                Event::SeriesChange {
                    object_id,
                    symbol,
                    interval_secs,
                },
            ) => {
                let interval = interval_secs
                    .map(|secs| {
                        TimeDelta::try_seconds(secs).ok_or(SeriesError::InvalidInterval { secs })
                    })
                    .transpose()?;
                self.change_series(&pane, &object_id, symbol, interval)
            }
            (Scope::Pane(pane), Event::IndicatorOptions { object_id, options }) => {
                self.set_indicator_options(&pane, &object_id, options)
            }
            (scope, event) => Err(SyncError::Misaddressed {
                what: SmolStr::new_static(event.name()),
                scope,
            }),
        }
    }

    /// Run one watcher pass, staging indicator updates and faults and dispatching
    /// offloaded recomputes.
    pub fn run_pass(&mut self) -> PassReport {
        let report = self.watcher.run_pass();

        for update in &report.updated {
            self.stage_update(update);
        }
        for fault in &report.faults {
            self.stage_fault(fault);
        }
        for dispatch in &report.dispatch {
            let outcome = self.dispatch(dispatch.clone());
            if outcome.is_err() {
                let _ = self.watcher.abandon(dispatch.node);
            }
            match outcome {
                Ok(()) => {}
                Err(SyncError::Task(TaskError::Closed)) => {
                    debug!(node = %dispatch.node, "skipping offload dispatch, emitter closed")
                }
                Err(error) => warn!(node = %dispatch.node, %error, "failed to dispatch offload"),
            }
        }
        report
    }

    fn stage_update(&mut self, update: &NodeUpdate) {
        if let Some(binding) = &update.binding {
            self.stage(
                binding.scope.clone(),
                Delta::IndicatorUpdate {
                    object_id: binding.object_id.clone(),
                    revision: update.revision,
                    output: Output::clone(&update.output),
                },
            );
        }
    }

    fn stage_fault(&mut self, fault: &NodeFault) {
        if let Some(binding) = self.watcher.binding(fault.node).cloned() {
            self.stage(
                binding.scope,
                Delta::IndicatorFault {
                    object_id: binding.object_id,
                    message: fault.message.clone(),
                },
            );
        }
    }

    /// Run an offloaded recompute as a tracked task, delivering its result through a second
    /// tracked task so cancelling the pane suppresses late results.
    fn dispatch(&mut self, dispatch: Dispatch) -> Result<(), SyncError> {
        let Dispatch { node, ticket, ctx } = dispatch;
        let job = self
            .offload_jobs
            .get(&node)
            .map(|entry| Arc::clone(&entry.0))
            .ok_or(GraphError::UnknownNode(node))?;
        let scope = self.watcher.binding(node).map(|binding| binding.scope.clone());
        let label = self.watcher.label(node).cloned().unwrap_or_default();

        let handle = self.emitter.offload(
            format_smolstr!("offload:{label}"),
            scope.clone(),
            move || evaluate(|| job(&ctx)),
        )?;

        let completions = self.completions_tx.clone();
        self.emitter
            .launch(format_smolstr!("deliver:{label}"), scope, async move {
                let result = handle.join().await?;
                completions
                    .send(OffloadCompletion {
                        node,
                        ticket,
                        result,
                    })
                    .map_err(|_| TaskError::Closed)
            })?;
        Ok(())
    }

    /// Fold every offload result delivered so far back into the graph, returning how many
    /// were folded. Updated outputs reach dependents on the next pass.
    pub fn collect_completions(&mut self) -> usize {
        let mut folded = 0;
        while let Ok(completion) = self.completions_rx.try_recv() {
            self.fold_completion(completion);
            folded += 1;
        }
        folded
    }

    fn fold_completion(&mut self, completion: OffloadCompletion) {
        let OffloadCompletion {
            node,
            ticket,
            result,
        } = completion;

        match self.watcher.complete(node, ticket, result) {
            Ok(Completed::Updated(update)) => self.stage_update(&update),
            Ok(Completed::Faulted(fault)) => self.stage_fault(&fault),
            Ok(Completed::Superseded) => {}
            Err(error) => debug!(%node, %error, "dropping offload result for removed node"),
        }
    }

    /// Send every staged delta in order, suspending under backpressure. Returns the number
    /// sent.
    pub async fn flush(&mut self) -> Result<usize, SyncError> {
        let staged = std::mem::take(&mut self.staged);
        let count = staged.len();

        for (scope, delta) in staged {
            self.tx.send(scope, delta).await?;
        }
        Ok(count)
    }

    /// Drive the workspace until `shutdown` resolves or the presentation side closes the
    /// channel.
    ///
    /// Each iteration handles, in priority order: shutdown, presentation events, live bars,
    /// offload results, history deliveries and the pass ticker. On exit the bar receiver is dropped, tracked
    /// tasks are drained, a final pass is flushed and the channel close handshake is
    /// performed.
    pub async fn run<F>(
        mut self,
        mut events: ChannelReceiver<Scope, Event>,
        mut bars: mpsc::Receiver<BarUpdate>,
        shutdown: F,
    ) -> Result<(), SyncError>
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.config.pass_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(pass_interval_ms = self.config.pass_interval.as_millis() as u64, "workspace running");

        let outcome = loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("workspace shutdown requested");
                    break Ok(());
                }

                event = events.recv() => match event {
                    Some(envelope) => {
                        let name = envelope.payload.name();
                        if let Err(error) = self.handle_event(envelope.scope, envelope.payload) {
                            warn!(seq = envelope.seq, event = name, %error, "presentation event rejected");
                        }
                    }
                    None => {
                        info!("presentation channel closed");
                        break Ok(());
                    }
                },

                Some(update) = bars.recv() => {
                    // Rejections are logged by ingest
                    let _ = self.upsert_bar(&update.scope, &update.series, update.bar);
                }

                Some(completion) = self.completions_rx.recv() => {
                    self.fold_completion(completion);
                }

                Some(delivery) = self.history_rx.recv() => {
                    self.fold_history(delivery);
                }

                _ = ticker.tick() => {
                    self.run_pass();
                    match self.flush().await {
                        Ok(_) => {}
                        Err(SyncError::Channel(ChannelError::ChannelClosed)) => {
                            info!("forward channel closed by peer");
                            break Ok(());
                        }
                        Err(error) if error.is_terminal() => break Err(error),
                        Err(error) => warn!(%error, "failed to flush staged deltas"),
                    }
                }
            }
        };

        // Producers launched on the emitter see the bar channel close and finish
        drop(bars);
        self.shutdown().await;
        outcome
    }

    async fn shutdown(&mut self) {
        let report = self.emitter.shutdown(self.config.drain_timeout).await;
        let folded = self.collect_completions() + self.collect_history();
        self.run_pass();

        if let Err(error) = self.flush().await {
            debug!(%error, "final flush skipped");
        }
        if let Err(error) = self.tx.close().await {
            warn!(%error, "forward channel close handshake failed");
        }

        info!(
            drained = report.completed,
            cancelled = report.cancelled,
            folded,
            "workspace stopped"
        );
    }

    fn series_node(&self, scope: &PaneScope, id: &ObjectId) -> Result<NodeId, SyncError> {
        match self.registry.resolve(scope, id)? {
            Entity::Series(node) => Ok(node),
            _ => Err(unknown(scope, id).into()),
        }
    }

    fn indicator_node(&self, scope: &PaneScope, id: &ObjectId) -> Result<NodeId, SyncError> {
        match self.registry.resolve(scope, id)? {
            Entity::Indicator(node) => Ok(node),
            _ => Err(unknown(scope, id).into()),
        }
    }

    fn input_nodes(&self, scope: &PaneScope, inputs: &[ObjectId]) -> Result<Vec<NodeId>, SyncError> {
        inputs
            .iter()
            .map(|id| -> Result<NodeId, SyncError> {
                self.registry
                    .resolve(scope, id)?
                    .node()
                    .ok_or_else(|| unknown(scope, id).into())
            })
            .collect()
    }
}

fn unknown(scope: &PaneScope, id: &ObjectId) -> IdentityError {
    IdentityError::UnknownIdentity {
        scope: scope.clone(),
        id: id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{primitive::Anchor, watcher::Point};
    use chartsync_integration::{ChannelConfig, ChannelLink, open, transport::memory};
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;

    type Computed = Result<Output, IndicatorError>;

    struct Harness {
        workspace: Workspace,
        _events: ChannelReceiver<Scope, Event>,
        _presentation: (ChannelSender<Scope, Event>, ChannelReceiver<Scope, Delta>),
        _links: (ChannelLink, ChannelLink),
    }

    fn harness() -> Harness {
        let (compute, presentation) = memory::pair(64);
        let (tx, events, compute_link) =
            open::<Scope, Delta, Event, _, _>(compute.0, compute.1, ChannelConfig::default());
        let (events_tx, deltas, presentation_link) = open::<Scope, Event, Delta, _, _>(
            presentation.0,
            presentation.1,
            ChannelConfig::default(),
        );

        Harness {
            workspace: Workspace::new(WorkspaceConfig::default().with_whitespace_bars(3), tx),
            _events: events,
            _presentation: (events_tx, deltas),
            _links: (compute_link, presentation_link),
        }
    }

    fn minute(m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 15, m, 0).unwrap()
    }

    fn bar(m: u32, close: f64) -> Bar {
        Bar::new(minute(m), close, close, close, close, 10.0)
    }

    fn doubled(ctx: &UpdateContext) -> Computed {
        let window = ctx.window(0, 1);
        let points = window
            .times()
            .into_iter()
            .zip(window.values())
            .map(|(time, value)| Point::new(time, value.map(|value| value * 2.0)))
            .collect();
        Ok(Output::Values(points))
    }

    fn line() -> Primitive {
        Primitive::new("trend_line", vec![Anchor::new(minute(0), 100.0)])
    }

    fn names(workspace: &Workspace) -> Vec<&'static str> {
        workspace.staged().iter().map(|(_, delta)| delta.name()).collect()
    }

    /// Workspace with a single frame of one pane, staged deltas cleared.
    fn single_pane(workspace: &mut Workspace) -> PaneScope {
        let frame = workspace.add_frame(Layout::Single).unwrap();
        workspace.staged.clear();
        workspace.layout().frame(&frame).unwrap().scopes().next().unwrap()
    }

    #[tokio::test]
    async fn test_layout_changes_stage_deltas() {
        let mut harness = harness();
        let workspace = &mut harness.workspace;

        let frame = workspace.add_frame(Layout::Single).unwrap();
        let added = workspace.set_layout(&frame, Layout::TripleVertical).unwrap();
        assert_eq!(added.len(), 2);
        assert_eq!(
            names(workspace),
            vec!["frame_add", "pane_add", "pane_add", "layout_set"]
        );

        let scopes: Vec<_> = workspace.layout().frame(&frame).unwrap().scopes().collect();
        assert!(scopes.iter().all(|scope| workspace.registry().has_scope(scope)));

        // All three panes are still required
        assert!(matches!(
            workspace.close_pane(&scopes[2]),
            Err(SyncError::Layout(LayoutError::PaneRequired { required: 3, .. }))
        ));

        workspace.set_layout(&frame, Layout::DoubleVertical).unwrap();
        workspace.close_pane(&scopes[2]).unwrap();
        assert!(!workspace.registry().has_scope(&scopes[2]));
        assert_eq!(workspace.layout().frame(&frame).unwrap().panes.len(), 2);
        assert!(matches!(
            workspace.staged().last(),
            Some((Scope::Frame(_), Delta::PaneRemove { .. }))
        ));

        workspace.close_frame(&frame).unwrap();
        assert!(workspace.layout().is_empty());
        assert!(!workspace.registry().has_scope(&scopes[0]));
    }

    #[tokio::test]
    async fn test_ingestion_errors_are_returned_not_staged() {
        let mut harness = harness();
        let workspace = &mut harness.workspace;
        let pane = single_pane(workspace);

        let series = workspace
            .add_series(&pane, "AAPL", TimeDelta::minutes(1), false)
            .unwrap();
        workspace.append_bar(&pane, &series, bar(1, 10.0)).unwrap();
        assert_eq!(names(workspace), vec!["series_create", "series_append"]);

        let error = workspace.append_bar(&pane, &series, bar(0, 9.0)).unwrap_err();
        assert!(matches!(error, SyncError::Series(_)));
        assert_eq!(workspace.staged().len(), 2);
        assert_eq!(workspace.series(&pane, &series).unwrap().bars().len(), 1);

        // Calendar adoption produces the whitespace tail, once
        let calendar = SessionCalendar::us_equities();
        workspace.set_calendar(&pane, &series, &calendar).unwrap();
        workspace.set_calendar(&pane, &series, &calendar).unwrap();
        let tails: Vec<_> = workspace
            .staged()
            .iter()
            .filter_map(|(_, delta)| match delta {
                Delta::Whitespace { times, .. } => Some(times.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(tails, vec![vec![minute(2), minute(3), minute(4)]]);
    }

    #[tokio::test]
    async fn test_pass_stages_indicator_updates_and_faults() {
        let mut harness = harness();
        let workspace = &mut harness.workspace;
        let pane = single_pane(workspace);

        let series = workspace
            .add_series(&pane, "AAPL", TimeDelta::minutes(1), false)
            .unwrap();
        let double = workspace
            .attach_indicator(&pane, "double", &[series.clone()], doubled)
            .unwrap();
        let broken = workspace
            .attach_indicator(
                &pane,
                "broken",
                &[series.clone()],
                |_: &UpdateContext| -> Computed { Err(IndicatorError::from("bad input")) },
            )
            .unwrap();
        workspace.staged.clear();

        workspace.append_bar(&pane, &series, bar(1, 21.0)).unwrap();
        workspace.run_pass();

        let staged: Vec<_> = workspace.staged().to_vec();
        assert!(staged.iter().any(|(scope, delta)| scope == &Scope::Pane(pane.clone())
            && matches!(
                delta,
                Delta::IndicatorUpdate { object_id, output: Output::Values(points), .. }
                    if object_id == &double && points[0].value == Some(42.0)
            )));
        assert!(staged.iter().any(|(_, delta)| matches!(
            delta,
            Delta::IndicatorFault { object_id, message } if object_id == &broken && message == "bad input"
        )));

        // Faulted indicator stays quiet until reset
        workspace.staged.clear();
        workspace.append_bar(&pane, &series, bar(2, 1.0)).unwrap();
        workspace.run_pass();
        assert_eq!(
            names(workspace),
            vec!["series_append", "indicator_update"]
        );

        workspace.reset_indicator(&pane, &broken).unwrap();
        workspace.run_pass();
        assert_eq!(names(workspace).last(), Some(&"indicator_fault"));

        // Still consumed by nothing, so it can be detached
        workspace.detach_indicator(&pane, &broken).unwrap();
        assert!(!workspace.registry().contains(&pane, &broken));
        assert!(matches!(
            workspace.remove_series(&pane, &series),
            Err(SyncError::Graph(GraphError::HasDependents { .. }))
        ));
    }

    #[tokio::test]
    async fn test_move_primitive_rescopes() {
        let mut harness = harness();
        let workspace = &mut harness.workspace;

        let frame = workspace.add_frame(Layout::DoubleHorizontal).unwrap();
        let scopes: Vec<_> = workspace.layout().frame(&frame).unwrap().scopes().collect();
        let (from, to) = (scopes[0].clone(), scopes[1].clone());
        workspace.staged.clear();

        let id = workspace.create_primitive(&from, line()).unwrap();
        let edited = line().with_style("width", serde_json::json!(2));
        workspace.edit_primitive(&from, &id, edited.clone()).unwrap();

        let new_id = workspace.move_primitive(&from, &id, &to).unwrap();

        assert!(workspace.primitive(&from, &id).is_err());
        assert_eq!(workspace.primitive(&to, &new_id).unwrap(), edited);
        assert_eq!(
            workspace.staged()[2..].to_vec(),
            vec![
                (
                    Scope::Pane(from.clone()),
                    Delta::PrimitiveRemove { object_id: id.clone() }
                ),
                (
                    Scope::Pane(to.clone()),
                    Delta::PrimitiveUpsert {
                        object_id: new_id.clone(),
                        primitive: edited
                    }
                ),
            ]
        );

        workspace.delete_primitive(&to, &new_id).unwrap();
        assert!(matches!(
            workspace.delete_primitive(&to, &new_id),
            Err(SyncError::Identity(IdentityError::UnknownIdentity { .. }))
        ));
    }

    #[tokio::test]
    async fn test_handle_event_rejects_misaddressed() {
        struct TestCase {
            scope: Scope,
            event: Event,
            expected: Option<&'static str>,
        }

        let mut harness = harness();
        let workspace = &mut harness.workspace;
        let pane = single_pane(workspace);
        let series = workspace
            .add_series(&pane, "AAPL", TimeDelta::minutes(1), false)
            .unwrap();

        let tests = vec![
            TestCase {
                // TC0: primitive created in a pane
                scope: Scope::Pane(pane.clone()),
                event: Event::PrimitiveCreate { primitive: line() },
                expected: None,
            },
            TestCase {
                // TC1: primitive created at window scope
                scope: Scope::Window,
                event: Event::PrimitiveCreate { primitive: line() },
                expected: Some("primitive_create"),
            },
            TestCase {
                // TC2: frame added at window scope
                scope: Scope::Window,
                event: Event::LayoutChange {
                    change: LayoutChange::AddFrame {
                        layout: Layout::Quad,
                    },
                },
                expected: None,
            },
            TestCase {
                // TC3: pane closed at frame scope
                scope: Scope::Frame(pane.frame.clone()),
                event: Event::LayoutChange {
                    change: LayoutChange::ClosePane,
                },
                expected: Some("layout_change"),
            },
            TestCase {
                // TC4: series changed at frame scope
                scope: Scope::Frame(pane.frame.clone()),
                event: Event::SeriesChange {
                    object_id: series.clone(),
                    symbol: Some("MSFT".into()),
                    interval_secs: None,
                },
                expected: Some("series_change"),
            },
            TestCase {
                // TC5: indicator options at window scope
                scope: Scope::Window,
                event: Event::IndicatorOptions {
                    object_id: series.clone(),
                    options: Options::new(),
                },
                expected: Some("indicator_options"),
            },
            TestCase {
                // TC6: series changed in its pane
                scope: Scope::Pane(pane.clone()),
                event: Event::SeriesChange {
                    object_id: series.clone(),
                    symbol: Some("MSFT".into()),
                    interval_secs: None,
                },
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = match workspace.handle_event(test.scope, test.event) {
                Ok(()) => None,
                Err(SyncError::Misaddressed { what, .. }) => Some(what),
                Err(other) => panic!("TC{index} unexpected error: {other}"),
            };
            assert_eq!(
                actual.as_deref(),
                test.expected,
                "TC{} failed",
                index
            );
        }
        assert_eq!(workspace.layout().len(), 2);
    }

    #[tokio::test]
    async fn test_series_change_events() {
        struct TestCase {
            object_id: ObjectId,
            symbol: Option<SmolStr>,
            interval_secs: Option<i64>,
            expected: Result<(&'static str, TimeDelta), SyncError>,
        }

        let mut harness = harness();
        let workspace = &mut harness.workspace;
        let pane = single_pane(workspace);
        let series = workspace
            .add_series(&pane, "AAPL", TimeDelta::minutes(1), false)
            .unwrap();
        let missing = ObjectId::from("s_gone00");

        let tests = vec![
            TestCase {
                // TC0: symbol only keeps the interval
                object_id: series.clone(),
                symbol: Some("MSFT".into()),
                interval_secs: None,
                expected: Ok(("MSFT", TimeDelta::minutes(1))),
            },
            TestCase {
                // TC1: interval only keeps the symbol
                object_id: series.clone(),
                symbol: None,
                interval_secs: Some(300),
                expected: Ok(("MSFT", TimeDelta::minutes(5))),
            },
            TestCase {
                // TC2: zero interval rejected, series untouched
                object_id: series.clone(),
                symbol: Some("TSLA".into()),
                interval_secs: Some(0),
                expected: Err(SeriesError::InvalidInterval { secs: 0 }.into()),
            },
            TestCase {
                // TC3: interval beyond the representable range
                object_id: series.clone(),
                symbol: None,
                interval_secs: Some(i64::MAX),
                expected: Err(SeriesError::InvalidInterval { secs: i64::MAX }.into()),
            },
            TestCase {
                // TC4: unknown series
                object_id: missing.clone(),
                symbol: Some("TSLA".into()),
                interval_secs: None,
                expected: Err(unknown(&pane, &missing).into()),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let event = Event::SeriesChange {
                object_id: test.object_id,
                symbol: test.symbol,
                interval_secs: test.interval_secs,
            };
            let actual = workspace
                .handle_event(Scope::Pane(pane.clone()), event)
                .map(|()| {
                    let store = workspace.series(&pane, &series).unwrap();
                    (store.symbol().to_string(), store.interval())
                });
            let expected = test
                .expected
                .map(|(symbol, interval)| (symbol.to_string(), interval));
            assert_eq!(actual, expected, "TC{} failed", index);
        }

        assert_eq!(
            names(workspace),
            vec!["series_create", "series_retarget", "series_retarget"]
        );
    }

    #[tokio::test]
    async fn test_series_change_reloads_history_and_restarts_indicators() {
        let Harness {
            workspace,
            _events,
            _presentation,
            _links,
        } = harness();
        let requests = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut workspace = {
            let requests = Arc::clone(&requests);
            workspace.with_history_loader(move |request: &HistoryRequest| {
                requests.lock().push(request.symbol.clone());
                if request.symbol == "FAIL" {
                    return Err(HistoryError::from("no such symbol"));
                }
                let step = request.interval.num_minutes() as u32;
                Ok((0..3).map(|i| bar(i * step, 100.0 + f64::from(i))).collect())
            })
        };

        let pane = single_pane(&mut workspace);
        let series = workspace
            .add_series(&pane, "AAPL", TimeDelta::minutes(1), false)
            .unwrap();
        let bounded = workspace
            .attach_indicator(&pane, "bounded", &[series.clone()], |ctx: &UpdateContext| {
                if ctx.window(0, 1).values().iter().flatten().any(|close| *close > 150.0) {
                    return Err(IndicatorError::from("close out of range"));
                }
                doubled(ctx)
            })
            .unwrap();
        let node = workspace.indicator_node(&pane, &bounded).unwrap();

        workspace.append_bar(&pane, &series, bar(0, 200.0)).unwrap();
        workspace.run_pass();
        assert!(workspace.watcher().is_faulted(node));
        workspace.staged.clear();

        // Superseded by the second change before either fetch is folded
        workspace
            .change_series(&pane, &series, Some("FAIL".into()), None)
            .unwrap();
        workspace
            .change_series(&pane, &series, Some("MSFT".into()), Some(TimeDelta::minutes(5)))
            .unwrap();
        assert!(!workspace.watcher().is_faulted(node));
        assert!(workspace.series(&pane, &series).unwrap().bars().is_empty());
        assert_eq!(names(&workspace), vec!["series_retarget", "series_retarget"]);

        workspace.emitter().drain(Duration::from_secs(5)).await;
        assert_eq!(workspace.collect_history(), 2);

        let store = workspace.series(&pane, &series).unwrap();
        assert_eq!(store.symbol(), "MSFT");
        assert_eq!(store.bars().len(), 3);
        assert_eq!(store.last().map(|bar| bar.time), Some(minute(10)));

        let mut fetched = requests.lock().clone();
        fetched.sort();
        assert_eq!(fetched, vec![SmolStr::new("FAIL"), SmolStr::new("MSFT")]);

        workspace.run_pass();
        assert!(matches!(
            workspace.staged().last(),
            Some((_, Delta::IndicatorUpdate { object_id, output: Output::Values(points), .. }))
                if object_id == &bounded && points[0].value == Some(204.0)
        ));
        assert_eq!(
            names(&workspace),
            vec!["series_retarget", "series_retarget", "series_reset", "indicator_update"]
        );
    }

    #[tokio::test]
    async fn test_indicator_options_event_recomputes() {
        let mut harness = harness();
        let workspace = &mut harness.workspace;
        let pane = single_pane(workspace);

        let series = workspace
            .add_series(&pane, "AAPL", TimeDelta::minutes(1), false)
            .unwrap();
        let scaled = workspace
            .attach_indicator(&pane, "scaled", &[series.clone()], |ctx: &UpdateContext| -> Computed {
                let factor = ctx.option::<f64>("factor").unwrap_or(1.0);
                let close = ctx.window(0, 1).values().into_iter().flatten().last();
                Ok(Output::Values(vec![Point::new(minute(1), close.map(|close| close * factor))]))
            })
            .unwrap();
        workspace.append_bar(&pane, &series, bar(1, 5.0)).unwrap();
        workspace.run_pass();
        workspace.staged.clear();

        let options = Options::from_iter([(SmolStr::new("factor"), serde_json::json!(3))]);
        workspace
            .handle_event(
                Scope::Pane(pane.clone()),
                Event::IndicatorOptions {
                    object_id: scaled.clone(),
                    options,
                },
            )
            .unwrap();
        workspace.run_pass();

        assert!(matches!(
            workspace.staged(),
            [(_, Delta::IndicatorUpdate { object_id, output: Output::Values(points), .. })]
                if object_id == &scaled && points[0].value == Some(15.0)
        ));
        assert!(matches!(
            workspace.set_indicator_options(&pane, &series, Options::new()),
            Err(SyncError::Identity(IdentityError::UnknownIdentity { .. }))
        ));
    }

    #[tokio::test]
    async fn test_offloaded_result_folds_back() {
        let mut harness = harness();
        let workspace = &mut harness.workspace;
        let pane = single_pane(workspace);

        let series = workspace
            .add_series(&pane, "AAPL", TimeDelta::minutes(1), false)
            .unwrap();
        let heavy = workspace
            .attach_offloaded(&pane, "heavy", &[series.clone()], doubled)
            .unwrap();
        workspace.append_bar(&pane, &series, bar(1, 5.0)).unwrap();
        workspace.staged.clear();

        let report = workspace.run_pass();
        assert_eq!(report.dispatch.len(), 1);
        assert!(workspace.staged().is_empty());

        workspace.emitter().drain(Duration::from_secs(5)).await;
        assert_eq!(workspace.collect_completions(), 1);

        assert!(matches!(
            workspace.staged(),
            [(_, Delta::IndicatorUpdate { object_id, output: Output::Values(points), .. })]
                if object_id == &heavy && points[0].value == Some(10.0)
        ));
    }

    #[tokio::test]
    async fn test_run_releases_bar_producers_before_drain() {
        let Harness {
            workspace,
            _events: events,
            _presentation: presentation,
            _links: links,
        } = harness();
        let emitter = workspace.emitter().clone();

        let (bars_tx, bars) = mpsc::channel::<BarUpdate>(4);
        let producer = emitter
            .launch("feed", None, async move {
                bars_tx.closed().await;
                Ok::<_, TaskError>("released")
            })
            .unwrap();

        let outcome = workspace.run(events, bars, std::future::ready(())).await;

        assert_eq!(outcome, Ok(()));
        assert_eq!(producer.join().await, Ok("released"));
        assert!(emitter.recent_failures().is_empty());
        assert_eq!(emitter.active(), 0);
        drop((presentation, links));
    }

    #[tokio::test]
    async fn test_close_pane_cancels_scoped_offload() {
        let mut harness = harness();
        let workspace = &mut harness.workspace;

        let frame = workspace.add_frame(Layout::DoubleVertical).unwrap();
        workspace.set_layout(&frame, Layout::Single).unwrap();
        let pane = workspace.layout().frame(&frame).unwrap().scopes().nth(1).unwrap();

        let series = workspace
            .add_series(&pane, "AAPL", TimeDelta::minutes(1), false)
            .unwrap();
        workspace
            .attach_offloaded(&pane, "slow", &[series.clone()], |ctx: &UpdateContext| {
                std::thread::sleep(Duration::from_millis(50));
                doubled(ctx)
            })
            .unwrap();
        workspace.append_bar(&pane, &series, bar(1, 5.0)).unwrap();
        workspace.run_pass();
        assert_eq!(workspace.emitter().active(), 2);

        workspace.close_pane(&pane).unwrap();
        assert_eq!(workspace.emitter().active(), 0);
        assert!(workspace.watcher().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(workspace.collect_completions(), 0);
        assert!(matches!(
            workspace.series(&pane, &series),
            Err(SyncError::Identity(IdentityError::UnknownIdentity { .. }))
        ));
    }
}
