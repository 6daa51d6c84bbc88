//! Backward-pass scheduler.
//!
//! One invocation runs one traversal to completion, single-threaded and
//! synchronous. The traversal proceeds in two phases:
//!
//! 1. **Dependency counting** — a reverse walk from the root creators
//!    computes, per grad-requiring function node, how many gradient
//!    deliveries it must receive before it may execute. Always-ready
//!    (stochastic) nodes are scheduled at discovery instead of counted.
//! 2. **Draining** — pop a ready node, invoke its backward computation with
//!    its accumulated buffer, and route each produced gradient to its
//!    consumer edge: leaves take the fast path, everything else decrements
//!    its dependency count and is enqueued on the 1→0 transition.
//!
//! The ready queue is an explicit LIFO stack: dispatch pops the
//! most-recently-pushed pair, so traversal order is last-producer-first
//! (DFS-like) and sibling buffers retire quickly instead of piling up.
//! Downstream determinism of floating-point summation order depends on
//! this, so it is a documented and tested property rather than an
//! implementation detail.
//!
//! All traversal state lives in the per-invocation [`Backward`] context;
//! concurrent traversals over disjoint graphs need no coordination.

use std::collections::{HashMap, HashSet};

use rune_core::{GraphError, Result, Value};

use crate::buffer::GradBuffer;
use crate::graph::{Graph, NodeId, Var};
use crate::node::{Edge, Node};

/// Run a backward traversal over `graph` from the given roots.
///
/// Each root pairs a forward-pass result with its initial gradient. Root
/// handles must come from `graph` itself; see [`Var`]. Gradients surface
/// through the leaves' accumulation targets (read back with
/// [`Graph::grad`]); success returns `()`.
///
/// With `retain_graph = false` the graph is marked consumed once operations
/// start executing, and any later traversal is rejected with
/// [`GraphError::GraphConsumed`]. The flag is also forwarded to every
/// [`crate::Op::apply`] call so operations may release saved forward state
/// on the final pass.
pub fn run_backward<V: Value>(
    graph: &Graph<V>,
    roots: Vec<(Var, V)>,
    retain_graph: bool,
) -> Result<()> {
    if graph.is_consumed() {
        return Err(GraphError::GraphConsumed);
    }
    tracing::debug!(roots = roots.len(), retain_graph, "starting backward traversal");

    let mut ctx = Backward::new(graph, retain_graph);
    let creators = ctx.seed(roots);
    ctx.compute_dependencies(creators);

    if !ctx.did_leaf_backward && ctx.ready.is_empty() {
        return Err(GraphError::NoPathRequiresGrad);
    }

    // Operations run from here on; a second pass over their consumed state
    // is not replayable even if this one fails.
    if !retain_graph {
        graph.mark_consumed();
    }

    ctx.drain()?;
    ctx.check_resolved()?;
    ctx.flush_leaves();

    tracing::debug!("backward traversal complete");
    Ok(())
}

/// Convenience entry taking roots and initial gradients as parallel
/// collections; rejects a length mismatch.
pub fn run_backward_split<V: Value>(
    graph: &Graph<V>,
    roots: &[Var],
    grads: Vec<V>,
    retain_graph: bool,
) -> Result<()> {
    if roots.len() != grads.len() {
        return Err(GraphError::RootCountMismatch {
            roots: roots.len(),
            grads: grads.len(),
        });
    }
    run_backward(graph, roots.iter().copied().zip(grads).collect(), retain_graph)
}

/// All traversal state for one invocation.
struct Backward<'g, V: Value> {
    graph: &'g Graph<V>,
    retain_graph: bool,
    /// LIFO ready stack of (node, consumed-on-dispatch buffer) pairs.
    ready: Vec<(NodeId, GradBuffer<V>)>,
    /// Buffers of nodes that received gradients but whose dependency count
    /// has not reached zero yet.
    not_ready: HashMap<NodeId, GradBuffer<V>>,
    /// Outstanding-delivery counts; entries are removed on the 1→0
    /// transition, so a missing or zero entry means a decrement would go
    /// negative.
    dependencies: HashMap<NodeId, usize>,
    /// Per-leaf staging: a single accumulator per touched leaf, flushed to
    /// the leaf's external target exactly once on success. Leaves need no
    /// dependency entries and no multi-slot buffers.
    leaf_sums: HashMap<NodeId, GradBuffer<V>>,
    did_leaf_backward: bool,
}

impl<'g, V: Value> Backward<'g, V> {
    fn new(graph: &'g Graph<V>, retain_graph: bool) -> Self {
        Self {
            graph,
            retain_graph,
            ready: Vec::new(),
            not_ready: HashMap::new(),
            dependencies: HashMap::new(),
            leaf_sums: HashMap::new(),
            did_leaf_backward: false,
        }
    }

    /// Seed the ready stack from the root set. Returns the creator nodes
    /// for dependency counting; leaf roots short-circuit through the fast
    /// path and contribute no creator.
    fn seed(&mut self, roots: Vec<(Var, V)>) -> Vec<NodeId> {
        let mut creators = Vec::with_capacity(roots.len());
        for (var, grad) in roots {
            match self.graph.node(var.node) {
                Node::Leaf(leaf) => {
                    if leaf.requires_grad {
                        tracing::trace!(node = var.node.index(), "leaf root, fast path");
                        self.stage_leaf(var.node, grad);
                        self.did_leaf_backward = true;
                    }
                }
                Node::Function(func) => {
                    creators.push(var.node);
                    // Roots have no consumers inside this traversal, so
                    // their dependency count is already zero.
                    if func.requires_grad {
                        let mut buf = GradBuffer::new(func.num_outputs);
                        buf.seed(var.output, grad);
                        self.ready.push((var.node, buf));
                    }
                }
            }
        }
        creators
    }

    /// Reverse walk from the creators, counting the gradient deliveries
    /// each grad-requiring function node must wait for. Always-ready nodes
    /// are pushed straight onto the stack at first discovery, before any
    /// count bookkeeping touches them; the `seen` set guards against a
    /// duplicate enqueue when they are reachable along several paths.
    ///
    /// `creators` may contain duplicates (two roots naming the same
    /// creator); each occurrence is walked so edge counts stay balanced
    /// with the duplicate dispatches seeding produced.
    fn compute_dependencies(&mut self, creators: Vec<NodeId>) {
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut queue = creators;
        while let Some(id) = queue.pop() {
            let Node::Function(func) = self.graph.node(id) else {
                continue;
            };
            for edge in &func.edges {
                match self.graph.node(edge.producer) {
                    // Leaves take the fast path: never counted, never
                    // buffered here.
                    Node::Leaf(_) => continue,
                    Node::Function(prev) => {
                        if prev.always_ready
                            && prev.requires_grad
                            && !seen.contains(&edge.producer)
                        {
                            tracing::trace!(
                                node = edge.producer.index(),
                                op = prev.op.name(),
                                "scheduling always-ready node"
                            );
                            self.ready
                                .push((edge.producer, GradBuffer::new(prev.num_outputs)));
                        } else if func.requires_grad && prev.requires_grad {
                            *self.dependencies.entry(edge.producer).or_insert(0) += 1;
                        }
                        if seen.insert(edge.producer) {
                            queue.push(edge.producer);
                        }
                    }
                }
            }
        }
    }

    /// Drain the ready stack to empty, dispatching one node at a time.
    fn drain(&mut self) -> Result<()> {
        while let Some((id, buffer)) = self.ready.pop() {
            let Node::Function(func) = self.graph.node(id) else {
                unreachable!("leaves are never scheduled");
            };
            let op_name = func.op.name();
            tracing::trace!(node = id.index(), op = op_name, "dispatching backward");

            let grads = buffer.into_slots();
            let produced = func
                .op
                .apply(&grads, self.retain_graph)
                .map_err(|source| GraphError::ComputationFailed {
                    node: id.index(),
                    op: op_name.to_string(),
                    source,
                })?;
            if produced.len() != func.edges.len() {
                return Err(GraphError::MalformedBackward {
                    node: id.index(),
                    op: op_name.to_string(),
                    expected: func.edges.len(),
                    got: produced.len(),
                });
            }

            for (edge, grad) in func.edges.iter().zip(produced) {
                let Some(grad) = grad else {
                    // The operation produced no gradient for this input.
                    continue;
                };
                self.route(*edge, grad)?;
            }
        }
        Ok(())
    }

    /// Route one produced gradient to its consumer edge.
    fn route(&mut self, edge: Edge, grad: V) -> Result<()> {
        match self.graph.node(edge.producer) {
            Node::Leaf(leaf) => {
                if leaf.requires_grad {
                    self.stage_leaf(edge.producer, grad);
                }
                Ok(())
            }
            Node::Function(prev) => {
                if !prev.requires_grad {
                    return Ok(());
                }
                if prev.always_ready {
                    // Already scheduled at discovery; a delivery after
                    // dispatch is discarded by policy.
                    tracing::trace!(
                        node = edge.producer.index(),
                        op = prev.op.name(),
                        "discarding gradient for dispatched always-ready node"
                    );
                    return Ok(());
                }
                let is_ready = self.free_dependency(edge.producer, prev.op.name())?;
                if is_ready {
                    let mut buf = self
                        .not_ready
                        .remove(&edge.producer)
                        .unwrap_or_else(|| GradBuffer::new(prev.num_outputs));
                    buf.accumulate(edge.output, grad);
                    self.ready.push((edge.producer, buf));
                } else {
                    let buf = self
                        .not_ready
                        .entry(edge.producer)
                        .or_insert_with(|| GradBuffer::new(prev.num_outputs));
                    buf.accumulate(edge.output, grad);
                }
                Ok(())
            }
        }
    }

    /// Decrement a node's dependency count; `true` exactly on the 1→0
    /// transition. A missing or already-zero entry means the decrement
    /// would go negative, which is fatal.
    fn free_dependency(&mut self, id: NodeId, op: &str) -> Result<bool> {
        let negative = |op: &str| GraphError::NegativeDependency {
            node: id.index(),
            op: op.to_string(),
        };
        let Some(deps) = self.dependencies.get_mut(&id) else {
            return Err(negative(op));
        };
        if *deps == 0 {
            return Err(negative(op));
        }
        *deps -= 1;
        if *deps == 0 {
            self.dependencies.remove(&id);
            return Ok(true);
        }
        Ok(false)
    }

    /// Fast-path staging: one accumulator per leaf, copy-on-second-write
    /// like any buffer slot.
    fn stage_leaf(&mut self, id: NodeId, grad: V) {
        tracing::trace!(node = id.index(), "leaf fast path");
        self.leaf_sums
            .entry(id)
            .or_insert_with(|| GradBuffer::new(1))
            .accumulate(0, grad);
    }

    /// Report nodes that never saw their count reach zero once the stack
    /// drained. Partially starved nodes sit in the not-ready table; fully
    /// starved ones (every consumer withheld its gradient) have only a
    /// leftover dependency entry and no buffer, so both tables are checked.
    /// Always-ready nodes reached along a second discovery path leave a
    /// dangling count by construction and are not stuck.
    fn check_resolved(&self) -> Result<()> {
        let mut stuck: Vec<NodeId> = self.not_ready.keys().copied().collect();
        for id in self.dependencies.keys() {
            let Node::Function(func) = self.graph.node(*id) else {
                continue;
            };
            if !func.always_ready && !self.not_ready.contains_key(id) {
                stuck.push(*id);
            }
        }
        if stuck.is_empty() {
            return Ok(());
        }
        let mut nodes: Vec<String> = stuck
            .iter()
            .map(|id| format!("{} (node {})", self.graph.node(*id).op_name(), id.index()))
            .collect();
        nodes.sort();
        Err(GraphError::UnresolvedNodes { nodes })
    }

    /// Deliver each staged leaf sum to its external accumulation target,
    /// exactly once per leaf per traversal.
    fn flush_leaves(&mut self) {
        for (id, buf) in self.leaf_sums.drain() {
            let Node::Leaf(leaf) = self.graph.node(id) else {
                unreachable!("only leaves are staged");
            };
            if let Some(sum) = buf.into_slots().pop().flatten() {
                leaf.accumulate_external(&sum);
            }
        }
    }
}
