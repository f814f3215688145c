use crate::{
    error::{GraphError, NodeFault},
    id::{NodeId, PaneScope},
};
use fnv::{FnvHashMap, FnvHashSet};
use itertools::Itertools;
use smol_str::SmolStr;
use std::{
    any::Any,
    collections::BTreeSet,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};
use tracing::{debug, warn};

/// Graph node internals plus the indicator contract.
pub mod node;

pub use node::{Binding, Indicator, OffloadJob, Options, Output, Point, UpdateContext, Window};
use node::{Node, NodeKind};

/// Drives incremental recomputation of the indicator dependency graph.
///
/// The graph is a DAG of source nodes (series snapshots) and indicator nodes. Changes are
/// recorded with [`notify`](Self::notify) and applied by [`run_pass`](Self::run_pass),
/// which walks nodes in topological order so every node sees the same pass's inputs, and
/// recomputes each dirty node at most once. A failing callback faults only its own node,
/// which then stays excluded from recomputation until [`reset`](Self::reset).
#[derive(Debug, Default)]
pub struct Watcher {
    nodes: FnvHashMap<NodeId, Node>,
    next_id: u64,
    order: Option<Vec<NodeId>>,
    pass: u64,
}

/// New output published by a node.
#[derive(Debug, Clone)]
pub struct NodeUpdate {
    pub node: NodeId,
    pub binding: Option<Binding>,
    pub output: Arc<Output>,
    pub revision: u64,
}

/// Recompute of an offloaded node to be run outside the pass.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub node: NodeId,
    pub ticket: u64,
    pub ctx: UpdateContext,
}

/// Summary of one [`Watcher::run_pass`].
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub pass: u64,
    pub recomputed: usize,
    pub updated: Vec<NodeUpdate>,
    pub faults: Vec<NodeFault>,
    pub dispatch: Vec<Dispatch>,
}

impl PassReport {
    pub fn is_empty(&self) -> bool {
        self.recomputed == 0 && self.dispatch.is_empty()
    }
}

/// Outcome of folding an offloaded result back into the graph.
#[derive(Debug, Clone)]
pub enum Completed {
    Updated(NodeUpdate),
    Faulted(NodeFault),
    /// A newer dispatch of the node is outstanding, or the node was reset.
    Superseded,
}

/// Node removed from the graph, possibly by cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed {
    pub node: NodeId,
    pub label: SmolStr,
    pub binding: Option<Binding>,
}

impl Watcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of the last completed pass.
    pub fn pass(&self) -> u64 {
        self.pass
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    /// Add a node whose output is set from outside the graph.
    pub fn register_source(&mut self, label: impl Into<SmolStr>) -> NodeId {
        let id = self.next_node_id();
        self.nodes.insert(id, Node::new(label.into(), NodeKind::Source));
        self.order = None;
        id
    }

    /// Add an indicator node computed inline during passes.
    pub fn register<I>(
        &mut self,
        label: impl Into<SmolStr>,
        inputs: &[NodeId],
        indicator: I,
    ) -> Result<NodeId, GraphError>
    where
        I: Indicator + 'static,
    {
        self.insert(label.into(), NodeKind::Indicator(Box::new(indicator)), inputs)
    }

    /// Add an indicator node whose recompute is handed back to the caller as a
    /// [`Dispatch`] and completed with [`Self::complete`].
    pub fn register_offloaded(
        &mut self,
        label: impl Into<SmolStr>,
        inputs: &[NodeId],
    ) -> Result<NodeId, GraphError> {
        self.insert(label.into(), NodeKind::Offloaded { ticket: 0 }, inputs)
    }

    fn insert(
        &mut self,
        label: SmolStr,
        kind: NodeKind,
        inputs: &[NodeId],
    ) -> Result<NodeId, GraphError> {
        if let Some(missing) = inputs.iter().find(|input| !self.contains(**input)) {
            return Err(GraphError::UnknownNode(*missing));
        }

        let id = self.next_node_id();
        self.nodes.insert(id, Node::new(label, kind));
        self.set_inputs(id, inputs)?;
        Ok(id)
    }

    fn next_node_id(&mut self) -> NodeId {
        self.next_id += 1;
        NodeId(self.next_id)
    }

    /// Re-wire the inputs of `node`, rejecting any wiring that would create a cycle. The
    /// node is recomputed on the next pass.
    pub fn set_inputs(&mut self, node: NodeId, inputs: &[NodeId]) -> Result<(), GraphError> {
        if !self.contains(node) {
            return Err(GraphError::UnknownNode(node));
        }

        for input in inputs {
            if !self.contains(*input) {
                return Err(GraphError::UnknownNode(*input));
            }
            if *input == node || self.depends_on(*input, node) {
                return Err(GraphError::Cycle {
                    node,
                    input: *input,
                });
            }
        }

        let previous = self
            .nodes
            .get(&node)
            .map(|entry| entry.inputs.clone())
            .unwrap_or_default();

        for input in previous.iter().unique() {
            if let Some(entry) = self.nodes.get_mut(input) {
                entry.dependents.retain(|dependent| *dependent != node);
            }
        }

        for input in inputs.iter().unique() {
            if let Some(entry) = self.nodes.get_mut(input) {
                entry.dependents.push(node);
            }
        }

        if let Some(entry) = self.nodes.get_mut(&node) {
            entry.inputs = inputs.to_vec();
            entry.consumed = vec![0; inputs.len()];
            entry.stale = !matches!(entry.kind, NodeKind::Source);
            entry.dirty = entry.stale;
            entry.pending = false;
        }

        self.order = None;
        Ok(())
    }

    /// Determine if `node` transitively consumes `target`.
    fn depends_on(&self, node: NodeId, target: NodeId) -> bool {
        let mut visited = FnvHashSet::default();
        let mut stack = vec![node];

        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(entry) = self.nodes.get(&current) {
                stack.extend(entry.inputs.iter().copied());
            }
        }
        false
    }

    pub fn bind(&mut self, node: NodeId, binding: Binding) -> Result<(), GraphError> {
        self.node_mut(node)?.binding = Some(binding);
        Ok(())
    }

    pub fn binding(&self, node: NodeId) -> Option<&Binding> {
        self.nodes.get(&node).and_then(|entry| entry.binding.as_ref())
    }

    pub fn label(&self, node: NodeId) -> Option<&SmolStr> {
        self.nodes.get(&node).map(|entry| &entry.label)
    }

    pub fn output(&self, node: NodeId) -> Option<Arc<Output>> {
        self.nodes.get(&node).map(|entry| Arc::clone(&entry.output))
    }

    pub fn revision(&self, node: NodeId) -> Option<u64> {
        self.nodes.get(&node).map(|entry| entry.revision)
    }

    pub fn inputs(&self, node: NodeId) -> Option<&[NodeId]> {
        self.nodes.get(&node).map(|entry| entry.inputs.as_slice())
    }

    pub fn dependents(&self, node: NodeId) -> Option<&[NodeId]> {
        self.nodes.get(&node).map(|entry| entry.dependents.as_slice())
    }

    /// Replace the output of a source node and notify its dependents.
    pub fn set_source(&mut self, node: NodeId, output: Output) -> Result<(), GraphError> {
        self.node_mut(node)?.set_output(output);
        self.notify(node)?;
        Ok(())
    }

    /// Mark every direct and transitive dependent of `node` dirty, returning how many nodes
    /// were marked. Nothing is recomputed until the next pass.
    pub fn notify(&mut self, node: NodeId) -> Result<usize, GraphError> {
        let mut stack = self.node(node)?.dependents.clone();
        let mut marked = FnvHashSet::default();

        while let Some(current) = stack.pop() {
            if !marked.insert(current) {
                continue;
            }
            if let Some(entry) = self.nodes.get_mut(&current) {
                entry.dirty = true;
                stack.extend(entry.dependents.iter().copied());
            }
        }
        Ok(marked.len())
    }

    /// Determine if `node` would be recomputed by the next pass.
    pub fn is_dirty(&self, node: NodeId) -> bool {
        let Some(entry) = self.nodes.get(&node) else {
            return false;
        };
        if entry.fault.is_some() || matches!(entry.kind, NodeKind::Source) {
            return false;
        }
        entry.stale || self.input_revisions(entry) != entry.consumed
    }

    pub fn is_faulted(&self, node: NodeId) -> bool {
        self.nodes
            .get(&node)
            .is_some_and(|entry| entry.fault.is_some())
    }

    /// Every node currently faulted.
    pub fn faults(&self) -> Vec<NodeFault> {
        self.nodes
            .values()
            .filter_map(|entry| entry.fault.clone())
            .sorted_by_key(|fault| fault.node)
            .collect()
    }

    /// Clear a node's fault and recompute it on the next pass.
    pub fn reset(&mut self, node: NodeId) -> Result<(), GraphError> {
        let entry = self.node_mut(node)?;
        if let Some(fault) = entry.fault.take() {
            debug!(%node, label = %entry.label, faulted_in = fault.pass, "resetting faulted node");
        }
        entry.stale = !matches!(entry.kind, NodeKind::Source);
        entry.dirty = entry.stale;
        entry.pending = false;
        Ok(())
    }

    pub fn options(&self, node: NodeId) -> Option<Arc<Options>> {
        self.nodes.get(&node).map(|entry| Arc::clone(&entry.options))
    }

    /// Replace the options of an indicator node and [`restart`](Self::restart) it.
    pub fn set_options(&mut self, node: NodeId, options: Options) -> Result<(), GraphError> {
        self.node_mut(node)?.options = Arc::new(options);
        self.restart(node).map(drop)
    }

    /// Discard the output and fault of `node` and of every transitive dependent so the next
    /// pass recomputes them from scratch. Outstanding offloaded results are discarded on
    /// arrival. Returns how many indicator nodes were restarted.
    pub fn restart(&mut self, node: NodeId) -> Result<usize, GraphError> {
        self.node(node)?;
        let mut stack = vec![node];
        let mut seen = FnvHashSet::default();
        let mut restarted = 0;

        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(entry) = self.nodes.get_mut(&current) else {
                continue;
            };
            stack.extend(entry.dependents.iter().copied());
            if matches!(entry.kind, NodeKind::Source) {
                continue;
            }

            if let Some(fault) = entry.fault.take() {
                debug!(node = %current, label = %entry.label, faulted_in = fault.pass, "restarting faulted node");
            }
            entry.output = Arc::new(Output::Empty);
            entry.stale = true;
            entry.dirty = true;
            entry.pending = false;
            restarted += 1;
        }
        Ok(restarted)
    }

    /// Determine if `node` has an offloaded recompute outstanding.
    pub fn is_pending(&self, node: NodeId) -> bool {
        self.nodes.get(&node).is_some_and(|entry| entry.pending)
    }

    /// Give up on the outstanding dispatch of `node`, recomputing it on the next pass.
    pub fn abandon(&mut self, node: NodeId) -> Result<(), GraphError> {
        let entry = self.node_mut(node)?;
        entry.pending = false;
        entry.stale = true;
        entry.dirty = true;
        Ok(())
    }

    /// Remove a node with no dependents.
    pub fn remove(&mut self, node: NodeId) -> Result<Removed, GraphError> {
        let dependents = self.node(node)?.dependents.clone();
        if !dependents.is_empty() {
            return Err(GraphError::HasDependents { node, dependents });
        }
        self.detach(node).ok_or(GraphError::UnknownNode(node))
    }

    /// Remove every node bound to `scope` together with everything depending on them.
    pub fn remove_scope(&mut self, scope: &PaneScope) -> Vec<Removed> {
        let mut doomed = FnvHashSet::default();
        let mut stack: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, entry)| {
                entry
                    .binding
                    .as_ref()
                    .is_some_and(|binding| &binding.scope == scope)
            })
            .map(|(id, _)| *id)
            .collect();

        while let Some(current) = stack.pop() {
            if doomed.insert(current) {
                if let Some(entry) = self.nodes.get(&current) {
                    stack.extend(entry.dependents.iter().copied());
                }
            }
        }

        // Dependents first so every detach leaves the graph consistent
        let order = self.topological_order();
        order
            .into_iter()
            .rev()
            .filter(|id| doomed.contains(id))
            .filter_map(|id| self.detach(id))
            .collect()
    }

    fn detach(&mut self, node: NodeId) -> Option<Removed> {
        let entry = self.nodes.remove(&node)?;

        for input in entry.inputs.iter().unique() {
            if let Some(upstream) = self.nodes.get_mut(input) {
                upstream.dependents.retain(|dependent| *dependent != node);
            }
        }
        for dependent in &entry.dependents {
            if let Some(downstream) = self.nodes.get_mut(dependent) {
                downstream.inputs.retain(|input| *input != node);
                downstream.consumed = vec![0; downstream.inputs.len()];
                downstream.stale = true;
            }
        }

        self.order = None;
        Some(Removed {
            node,
            label: entry.label,
            binding: entry.binding,
        })
    }

    /// Recompute every dirty node once, inputs before dependents.
    ///
    /// Nodes downstream of an outstanding offloaded recompute are held dirty until its
    /// result is folded back, so they never combine a stale offloaded output with inputs
    /// already updated by a newer pass.
    pub fn run_pass(&mut self) -> PassReport {
        self.pass += 1;
        let pass = self.pass;
        let mut report = PassReport {
            pass,
            ..PassReport::default()
        };
        let mut held = FnvHashSet::default();

        for id in self.topological_order() {
            let Some(entry) = self.nodes.get(&id) else {
                continue;
            };
            let blocked = entry.inputs.iter().any(|input| {
                held.contains(input) || self.nodes.get(input).is_some_and(|upstream| upstream.pending)
            });
            if blocked {
                held.insert(id);
                continue;
            }
            if !(entry.dirty || entry.stale) {
                continue;
            }

            let revisions = self.input_revisions(entry);
            let skip = entry.fault.is_some()
                || matches!(entry.kind, NodeKind::Source)
                || (!entry.stale && revisions == entry.consumed);

            if skip {
                if let Some(entry) = self.nodes.get_mut(&id) {
                    entry.dirty = false;
                }
                continue;
            }

            let inputs = entry
                .inputs
                .iter()
                .map(|input| {
                    self.nodes
                        .get(input)
                        .map(|upstream| Arc::clone(&upstream.output))
                        .unwrap_or_default()
                })
                .collect();
            let ctx = UpdateContext::new(pass, id, inputs, Arc::clone(&entry.output))
                .with_options(Arc::clone(&entry.options));

            let Some(entry) = self.nodes.get_mut(&id) else {
                continue;
            };
            entry.dirty = false;
            entry.stale = false;
            entry.consumed = revisions;

            let outcome = match &mut entry.kind {
                NodeKind::Source => continue,
                NodeKind::Offloaded { ticket } => {
                    *ticket += 1;
                    entry.pending = true;
                    report.dispatch.push(Dispatch {
                        node: id,
                        ticket: *ticket,
                        ctx,
                    });
                    continue;
                }
                NodeKind::Indicator(indicator) => evaluate(|| indicator.update(&ctx)),
            };

            report.recomputed += 1;
            match outcome {
                Ok(output) => {
                    let update = self.publish(id, output);
                    report.updated.extend(update);
                }
                Err(message) => {
                    let fault = self.record_fault(id, message);
                    report.faults.extend(fault);
                }
            }
        }

        if !report.is_empty() {
            debug!(
                pass,
                recomputed = report.recomputed,
                updated = report.updated.len(),
                faulted = report.faults.len(),
                dispatched = report.dispatch.len(),
                "watcher pass complete"
            );
        }
        report
    }

    /// Fold the result of a [`Dispatch`] back into the graph as an ordinary output change.
    pub fn complete(
        &mut self,
        node: NodeId,
        ticket: u64,
        result: Result<Output, String>,
    ) -> Result<Completed, GraphError> {
        let entry = self.node(node)?;
        let current = match entry.kind {
            NodeKind::Offloaded { ticket } => ticket,
            _ => return Ok(Completed::Superseded),
        };
        if current != ticket || entry.stale || entry.fault.is_some() {
            debug!(%node, ticket, current, "discarding superseded offload result");
            return Ok(Completed::Superseded);
        }

        if let Some(entry) = self.nodes.get_mut(&node) {
            entry.pending = false;
        }
        let completed = match result {
            Ok(output) => self.publish(node, output).map(Completed::Updated),
            Err(message) => self.record_fault(node, message).map(Completed::Faulted),
        };
        completed.ok_or(GraphError::UnknownNode(node))
    }

    fn publish(&mut self, node: NodeId, output: Output) -> Option<NodeUpdate> {
        let entry = self.nodes.get_mut(&node)?;
        entry.set_output(output);

        let update = NodeUpdate {
            node,
            binding: entry.binding.clone(),
            output: Arc::clone(&entry.output),
            revision: entry.revision,
        };

        for dependent in entry.dependents.clone() {
            if let Some(downstream) = self.nodes.get_mut(&dependent) {
                downstream.dirty = true;
            }
        }
        Some(update)
    }

    fn record_fault(&mut self, node: NodeId, message: String) -> Option<NodeFault> {
        let pass = self.pass;
        let entry = self.nodes.get_mut(&node)?;

        let fault = NodeFault {
            node,
            label: entry.label.clone(),
            pass,
            message,
        };
        warn!(
            %node,
            label = %fault.label,
            pass,
            error = %fault.message,
            "indicator node faulted, excluded until reset"
        );

        entry.fault = Some(fault.clone());
        Some(fault)
    }

    fn input_revisions(&self, entry: &Node) -> Vec<u64> {
        entry
            .inputs
            .iter()
            .map(|input| {
                self.nodes
                    .get(input)
                    .map(|upstream| upstream.revision)
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Cached topological order, ties broken by node id.
    fn topological_order(&mut self) -> Vec<NodeId> {
        if let Some(order) = &self.order {
            return order.clone();
        }

        let mut indegree: FnvHashMap<NodeId, usize> = self
            .nodes
            .iter()
            .map(|(id, entry)| (*id, entry.inputs.iter().unique().count()))
            .collect();

        let mut ready: BTreeSet<NodeId> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            let Some(entry) = self.nodes.get(&id) else {
                continue;
            };
            for dependent in &entry.dependents {
                if let Some(degree) = indegree.get_mut(dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        self.order = Some(order.clone());
        order
    }

    fn node(&self, node: NodeId) -> Result<&Node, GraphError> {
        self.nodes.get(&node).ok_or(GraphError::UnknownNode(node))
    }

    fn node_mut(&mut self, node: NodeId) -> Result<&mut Node, GraphError> {
        self.nodes.get_mut(&node).ok_or(GraphError::UnknownNode(node))
    }
}

/// Run an indicator computation inside a failure boundary, turning both `Err` returns and
/// panics into a fault message.
pub fn evaluate<F>(compute: F) -> Result<Output, String>
where
    F: FnOnce() -> Result<Output, crate::error::IndicatorError>,
{
    match catch_unwind(AssertUnwindSafe(compute)) {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(error)) => Err(error.to_string()),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::IndicatorError, id::ObjectId};
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Computed = Result<Output, IndicatorError>;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap()
    }

    fn scalar(value: f64) -> Output {
        Output::Values(vec![Point::new(t0(), Some(value))])
    }

    fn read(output: &Output) -> f64 {
        match output {
            Output::Values(points) => points.last().and_then(|point| point.value).unwrap(),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    fn input(ctx: &UpdateContext, index: usize) -> f64 {
        ctx.input(index).map(read).unwrap()
    }

    fn empty() -> impl Indicator + 'static {
        |_: &UpdateContext| -> Computed { Ok(Output::Empty) }
    }

    /// Indicator applying `f` to its inputs, counting invocations.
    fn counted(
        calls: &Arc<AtomicUsize>,
        f: impl Fn(&[f64]) -> f64 + Send + 'static,
    ) -> impl Indicator + 'static {
        let calls = Arc::clone(calls);
        move |ctx: &UpdateContext| -> Computed {
            calls.fetch_add(1, Ordering::SeqCst);
            let values: Vec<f64> = (0..ctx.inputs().len()).map(|i| input(ctx, i)).collect();
            Ok(scalar(f(&values)))
        }
    }

    #[test]
    fn test_update_storm_recomputes_dependent_once_per_pass() {
        let mut watcher = Watcher::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let a = watcher.register_source("a");
        let b = watcher.register_source("b");
        watcher.set_source(a, scalar(1.0)).unwrap();
        watcher.set_source(b, scalar(1.0)).unwrap();
        let sum = watcher
            .register("sum", &[a, b], counted(&calls, |v| v.iter().sum()))
            .unwrap();

        watcher.run_pass();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        for value in 0..5 {
            watcher.set_source(a, scalar(value as f64)).unwrap();
        }
        for value in 0..3 {
            watcher.set_source(b, scalar(value as f64)).unwrap();
        }
        assert!(watcher.is_dirty(sum));

        let report = watcher.run_pass();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.recomputed, 1);
        assert_eq!(read(&watcher.output(sum).unwrap()), 6.0);

        // Nothing changed: clean nodes are not recomputed
        let report = watcher.run_pass();
        assert!(report.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_diamond_observes_single_pass() {
        let mut watcher = Watcher::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let a = watcher.register_source("a");
        let b = watcher
            .register("b", &[a], counted(&calls, |v| v[0] * 2.0))
            .unwrap();
        let c = watcher
            .register("c", &[a], counted(&calls, |v| v[0] + 1.0))
            .unwrap();
        let d = watcher
            .register("d", &[b, c], counted(&calls, |v| v[0] + v[1]))
            .unwrap();

        for value in [1.0, 5.0, 10.0] {
            watcher.set_source(a, scalar(value)).unwrap();
            watcher.run_pass();

            // D depends only on this pass's A: 2a + (a + 1)
            assert_eq!(read(&watcher.output(d).unwrap()), 3.0 * value + 1.0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn test_diamond_waits_for_offloaded_branch() {
        let mut watcher = Watcher::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let a = watcher.register_source("a");
        let b = watcher.register_offloaded("b", &[a]).unwrap();
        let c = watcher
            .register("c", &[a], counted(&calls, |v| v[0] + 1.0))
            .unwrap();
        let d = watcher
            .register("d", &[b, c], counted(&calls, |v| v[0] + v[1]))
            .unwrap();

        // Offloaded b = 2a, completed from the dispatched context
        let settle = |watcher: &mut Watcher, report: PassReport| {
            for dispatch in report.dispatch {
                let value = input(&dispatch.ctx, 0) * 2.0;
                watcher
                    .complete(dispatch.node, dispatch.ticket, Ok(scalar(value)))
                    .unwrap();
            }
            watcher.run_pass()
        };

        watcher.set_source(a, scalar(1.0)).unwrap();
        let report = watcher.run_pass();
        assert!(watcher.is_pending(b));
        assert!(report.updated.iter().all(|update| update.node != d));
        settle(&mut watcher, report);
        assert_eq!(read(&watcher.output(d).unwrap()), 4.0);

        watcher.set_source(a, scalar(10.0)).unwrap();
        let report = watcher.run_pass();

        // c is fresh but d is held until b folds back
        assert_eq!(read(&watcher.output(c).unwrap()), 11.0);
        assert!(report.updated.iter().all(|update| update.node != d));
        assert_eq!(read(&watcher.output(d).unwrap()), 4.0);

        let report = settle(&mut watcher, report);
        let published: Vec<_> = report
            .updated
            .iter()
            .filter(|update| update.node == d)
            .map(|update| read(&update.output))
            .collect();
        assert_eq!(published, vec![31.0]);
        assert!(!watcher.is_pending(b));

        // c twice, d twice
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_abandoned_dispatch_releases_dependents() {
        let mut watcher = Watcher::new();
        let a = watcher.register_source("a");
        let b = watcher.register_offloaded("b", &[a]).unwrap();
        let c = watcher.register("c", &[b], empty()).unwrap();

        watcher.set_source(a, scalar(1.0)).unwrap();
        let first = watcher.run_pass();
        assert!(watcher.is_pending(b));

        watcher.abandon(b).unwrap();
        assert!(!watcher.is_pending(b));
        assert!(matches!(
            watcher.complete(b, first.dispatch[0].ticket, Ok(scalar(2.0))),
            Ok(Completed::Superseded)
        ));

        // Re-dispatched on the next pass, dependent still held behind it
        let second = watcher.run_pass();
        assert_eq!(second.dispatch.len(), 1);
        assert!(second.updated.iter().all(|update| update.node != c));
    }

    #[test]
    fn test_failing_node_stays_faulted_until_reset() {
        let mut watcher = Watcher::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let a = watcher.register_source("a");
        watcher.set_source(a, scalar(1.0)).unwrap();

        let failing = {
            let calls = Arc::clone(&calls);
            watcher
                .register("broken", &[a], move |_: &UpdateContext| -> Computed {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(IndicatorError::from("window too short"))
                })
                .unwrap()
        };

        let report = watcher.run_pass();
        assert_eq!(report.faults.len(), 1);
        assert_eq!(report.faults[0].message, "window too short");

        for value in 2..6 {
            watcher.set_source(a, scalar(value as f64)).unwrap();
            let report = watcher.run_pass();
            assert!(report.faults.is_empty());
            assert!(watcher.is_faulted(failing));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.faults().len(), 1);

        watcher.reset(failing).unwrap();
        assert!(!watcher.is_faulted(failing));

        let report = watcher.run_pass();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.faults.len(), 1);
        assert!(watcher.is_faulted(failing));
    }

    #[test]
    fn test_options_change_recomputes_from_scratch() {
        let mut watcher = Watcher::new();
        let a = watcher.register_source("a");
        let scaled = watcher
            .register("scaled", &[a], |ctx: &UpdateContext| -> Computed {
                let factor = ctx.option::<f64>("factor").ok_or("factor must be a number")?;
                Ok(scalar(input(ctx, 0) * factor))
            })
            .unwrap();
        let shifted = watcher
            .register("shifted", &[scaled], |ctx: &UpdateContext| -> Computed {
                Ok(match ctx.input(0) {
                    Some(output @ Output::Values(_)) => scalar(read(output) + 1.0),
                    _ => Output::Empty,
                })
            })
            .unwrap();

        watcher.set_source(a, scalar(3.0)).unwrap();
        let report = watcher.run_pass();
        assert_eq!(report.faults.len(), 1);
        assert!(watcher.is_faulted(scaled));

        let options = Options::from_iter([(SmolStr::new("factor"), serde_json::json!(2.0))]);
        watcher.set_options(scaled, options).unwrap();
        assert!(!watcher.is_faulted(scaled));
        assert!(watcher.is_dirty(scaled));

        let report = watcher.run_pass();
        assert!(report.faults.is_empty());
        assert_eq!(read(&watcher.output(scaled).unwrap()), 6.0);
        assert_eq!(read(&watcher.output(shifted).unwrap()), 7.0);
        assert_eq!(
            watcher.options(scaled).unwrap().get("factor"),
            Some(&serde_json::json!(2.0))
        );

        assert_eq!(
            watcher.set_options(NodeId(99), Options::new()),
            Err(GraphError::UnknownNode(NodeId(99)))
        );
    }

    #[test]
    fn test_restart_clears_downstream() {
        let mut watcher = Watcher::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let a = watcher.register_source("a");
        let b = watcher.register("b", &[a], counted(&calls, |v| v[0] + 1.0)).unwrap();
        let c = watcher
            .register("c", &[b], |ctx: &UpdateContext| -> Computed {
                if matches!(ctx.prior(), Output::Values(_)) {
                    return Err(IndicatorError::from("already computed"));
                }
                Ok(scalar(input(ctx, 0)))
            })
            .unwrap();

        watcher.set_source(a, scalar(1.0)).unwrap();
        watcher.run_pass();
        watcher.set_source(a, scalar(2.0)).unwrap();
        watcher.run_pass();
        assert!(watcher.is_faulted(c));

        assert_eq!(watcher.restart(a), Ok(2));
        assert!(!watcher.is_faulted(c));
        assert_eq!(watcher.output(b).as_deref(), Some(&Output::Empty));

        watcher.set_source(a, scalar(5.0)).unwrap();
        let report = watcher.run_pass();
        assert!(report.faults.is_empty());
        assert_eq!(read(&watcher.output(c).unwrap()), 6.0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_fault_is_isolated_and_keeps_last_good_output() {
        let mut watcher = Watcher::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let a = watcher.register_source("a");
        let flaky = watcher
            .register("flaky", &[a], |ctx: &UpdateContext| -> Computed {
                let value = input(ctx, 0);
                if value > 1.0 {
                    panic!("diverged at {value}");
                }
                Ok(scalar(value))
            })
            .unwrap();
        let healthy = watcher
            .register("healthy", &[a], counted(&calls, |v| v[0]))
            .unwrap();

        watcher.set_source(a, scalar(1.0)).unwrap();
        watcher.run_pass();

        watcher.set_source(a, scalar(2.0)).unwrap();
        let report = watcher.run_pass();

        assert_eq!(report.faults.len(), 1);
        assert_eq!(report.faults[0].node, flaky);
        assert_eq!(report.faults[0].message, "panicked: diverged at 2");
        assert_eq!(read(&watcher.output(flaky).unwrap()), 1.0);
        assert_eq!(read(&watcher.output(healthy).unwrap()), 2.0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rewiring_into_cycle_fails() {
        struct TestCase {
            node: usize,
            inputs: Vec<usize>,
            expected: Result<(), GraphError>,
        }

        let tests = vec![
            TestCase {
                // TC0: self loop
                node: 1,
                inputs: vec![1],
                expected: Err(GraphError::Cycle {
                    node: NodeId(2),
                    input: NodeId(2),
                }),
            },
            TestCase {
                // TC1: dependent as input
                node: 1,
                inputs: vec![2],
                expected: Err(GraphError::Cycle {
                    node: NodeId(2),
                    input: NodeId(3),
                }),
            },
            TestCase {
                // TC2: unknown input
                node: 1,
                inputs: vec![9],
                expected: Err(GraphError::UnknownNode(NodeId(10))),
            },
            TestCase {
                // TC3: valid re-wiring
                node: 2,
                inputs: vec![0],
                expected: Ok(()),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            // Chain: n1 (source) -> n2 -> n3
            let mut watcher = Watcher::new();
            let a = watcher.register_source("a");
            let b = watcher.register("b", &[a], empty()).unwrap();
            let c = watcher.register("c", &[b], empty()).unwrap();
            let ids = [a, b, c];
            let lookup = |i: usize| ids.get(i).copied().unwrap_or(NodeId(i as u64 + 1));

            let inputs: Vec<_> = test.inputs.iter().map(|i| lookup(*i)).collect();
            let actual = watcher.set_inputs(lookup(test.node), &inputs);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_remove_and_remove_scope() {
        let mut watcher = Watcher::new();
        let pane = PaneScope::new("f_a", "p_a");
        let other = PaneScope::new("f_a", "p_b");

        let a = watcher.register_source("a");
        watcher.bind(a, Binding::new(pane.clone(), ObjectId::from("s_a"))).unwrap();
        let b = watcher.register("b", &[a], empty()).unwrap();
        watcher.bind(b, Binding::new(pane.clone(), ObjectId::from("i_b"))).unwrap();
        let c = watcher.register("c", &[b], empty()).unwrap();
        watcher.bind(c, Binding::new(other.clone(), ObjectId::from("i_c"))).unwrap();
        let unrelated = watcher.register_source("z");

        assert_eq!(
            watcher.remove(a).unwrap_err(),
            GraphError::HasDependents {
                node: a,
                dependents: vec![b]
            }
        );

        let removed: Vec<_> = watcher.remove_scope(&pane).into_iter().map(|r| r.node).collect();

        // Dependents are removed first, including the cross-pane dependent
        assert_eq!(removed, vec![c, b, a]);
        assert_eq!(watcher.len(), 1);
        assert!(watcher.contains(unrelated));
        assert_eq!(watcher.remove(unrelated).map(|r| r.label), Ok(SmolStr::new("z")));
    }

    #[test]
    fn test_offloaded_results_fold_back_as_input_change() {
        let mut watcher = Watcher::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let a = watcher.register_source("a");
        let heavy = watcher.register_offloaded("heavy", &[a]).unwrap();
        let after = {
            let calls = Arc::clone(&calls);
            watcher
                .register("after", &[heavy], move |ctx: &UpdateContext| -> Computed {
                    if ctx.input(0).is_some_and(Output::is_empty) {
                        return Ok(Output::Empty);
                    }
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(scalar(input(ctx, 0) * 10.0))
                })
                .unwrap()
        };

        watcher.set_source(a, scalar(1.0)).unwrap();
        let first = watcher.run_pass();
        assert_eq!(first.dispatch.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        watcher.set_source(a, scalar(2.0)).unwrap();
        let second = watcher.run_pass();
        assert_eq!(second.dispatch.len(), 1);

        // Stale ticket is discarded
        let stale = first.dispatch[0].clone();
        assert!(matches!(
            watcher.complete(heavy, stale.ticket, Ok(scalar(99.0))),
            Ok(Completed::Superseded)
        ));

        let dispatch = second.dispatch[0].clone();
        let value = input(&dispatch.ctx, 0);
        assert!(matches!(
            watcher.complete(heavy, dispatch.ticket, Ok(scalar(value))),
            Ok(Completed::Updated(_))
        ));

        watcher.run_pass();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(read(&watcher.output(after).unwrap()), 20.0);
    }
}
