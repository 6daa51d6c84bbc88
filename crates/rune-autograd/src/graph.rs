//! Arena-allocated backward graph.
//!
//! All nodes recorded for one forward pass live in a single `Graph`; edges
//! are indices into the arena rather than owning references, so reference
//! cycles cannot form and teardown is a single drop. Handles (`NodeId`,
//! `Var`) stay valid for the life of the graph.

use std::sync::atomic::{AtomicBool, Ordering};

use smallvec::SmallVec;

use rune_core::{Result, Value};

use crate::engine;
use crate::node::{Edge, FunctionNode, LeafNode, Node, Op};
use crate::scope;

/// Index of a node in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Handle to one output slot of a recorded node.
///
/// This is what callers hold for each forward-pass result and what they
/// pass as backward roots: the producing node plus the output slot the
/// value came from.
///
/// A handle is only meaningful with the graph that created it. Indexing a
/// different graph with it panics on an out-of-range id or silently names
/// an unrelated node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Var {
    pub(crate) node: NodeId,
    pub(crate) output: usize,
}

impl Var {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn output(&self) -> usize {
        self.output
    }
}

/// The recorded backward graph for one forward pass.
///
/// The engine treats nodes as read-only; all mutable traversal state
/// (dependency counts, gradient buffers) lives in the per-invocation
/// context inside [`crate::engine`], never on the nodes themselves.
pub struct Graph<V: Value> {
    nodes: Vec<Node<V>>,
    /// Set by a backward pass that ran without `retain_graph`; later
    /// traversals are rejected.
    consumed: AtomicBool,
}

impl<V: Value> Graph<V> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            consumed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Record a leaf (variable). Its gradient, if any, is read back with
    /// [`Graph::grad`] after a backward pass.
    ///
    /// Grad mode does not apply here: a leaf created inside a
    /// [`crate::NoGradGuard`] scope keeps its `requires_grad` flag, the
    /// scope only stops *operations* from being tracked.
    pub fn leaf(&mut self, requires_grad: bool) -> Var {
        let id = self.push(Node::Leaf(LeafNode::new(requires_grad)));
        Var { node: id, output: 0 }
    }

    /// Record an operation over `inputs`, producing `num_outputs` slots.
    ///
    /// The node requires grad iff grad mode is enabled and any input does.
    pub fn apply(
        &mut self,
        op: Box<dyn Op<V>>,
        inputs: &[Var],
        num_outputs: usize,
    ) -> Vec<Var> {
        self.record(op, inputs, num_outputs, false)
    }

    /// Record a stochastic (always-ready) operation: it is scheduled
    /// immediately upon discovery during backward, bypassing dependency
    /// counting.
    pub fn apply_stochastic(
        &mut self,
        op: Box<dyn Op<V>>,
        inputs: &[Var],
        num_outputs: usize,
    ) -> Vec<Var> {
        self.record(op, inputs, num_outputs, true)
    }

    fn record(
        &mut self,
        op: Box<dyn Op<V>>,
        inputs: &[Var],
        num_outputs: usize,
        always_ready: bool,
    ) -> Vec<Var> {
        let requires_grad =
            scope::is_grad_enabled() && inputs.iter().any(|v| self.requires_grad(v));
        let edges: SmallVec<[Edge; 2]> = inputs
            .iter()
            .map(|v| Edge {
                producer: v.node,
                output: v.output,
            })
            .collect();
        let id = self.push(Node::Function(FunctionNode {
            op,
            edges,
            num_outputs,
            requires_grad,
            always_ready,
        }));
        (0..num_outputs)
            .map(|output| Var { node: id, output })
            .collect()
    }

    fn push(&mut self, node: Node<V>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub fn requires_grad(&self, var: &Var) -> bool {
        self.node(var.node).requires_grad()
    }

    pub fn is_leaf(&self, var: &Var) -> bool {
        self.node(var.node).is_leaf()
    }

    /// Read back the gradient accumulated on a leaf. `None` for leaves that
    /// received nothing and for non-leaf handles.
    pub fn grad(&self, var: &Var) -> Option<V> {
        match self.node(var.node) {
            Node::Leaf(leaf) => leaf.grad.read().clone(),
            Node::Function(_) => None,
        }
    }

    /// Clear accumulated gradients on every leaf.
    pub fn zero_grad(&self) {
        for node in &self.nodes {
            if let Node::Leaf(leaf) = node {
                *leaf.grad.write() = None;
            }
        }
    }

    /// Register a hook on a leaf; it observes the gradient delivered by a
    /// backward pass, before accumulation. Each traversal coalesces all
    /// contributions to a leaf into one delivery, so the hook sees the
    /// per-pass sum. Has no effect on non-leaf handles.
    pub fn register_hook<F>(&self, var: &Var, hook: F)
    where
        F: Fn(&V) + Send + Sync + 'static,
    {
        if let Node::Leaf(leaf) = self.node(var.node) {
            leaf.hooks.write().push(Box::new(hook));
        }
    }

    /// Run a backward traversal from `roots`. See [`engine::run_backward`].
    pub fn backward(&self, roots: Vec<(Var, V)>, retain_graph: bool) -> Result<()> {
        engine::run_backward(self, roots, retain_graph)
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node<V> {
        &self.nodes[id.0]
    }

    pub(crate) fn is_consumed(&self) -> bool {
        self.consumed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_consumed(&self) {
        self.consumed.store(true, Ordering::Release);
    }

    /// Rewire an existing edge. The arena API cannot express cycles, so
    /// engine tests use this to hand-build broken graphs.
    #[cfg(test)]
    pub(crate) fn rewire_edge(&mut self, node: NodeId, edge_idx: usize, edge: Edge) {
        match &mut self.nodes[node.0] {
            Node::Function(f) => f.edges[edge_idx] = edge,
            Node::Leaf(_) => panic!("leaves have no edges"),
        }
    }
}

impl<V: Value> Default for Graph<V> {
    fn default() -> Self {
        Self::new()
    }
}
