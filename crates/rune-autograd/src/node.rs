//! Node model for the backward graph.
//!
//! Defines the `Op` trait (the one polymorphic seam the scheduler dispatches
//! through) and the two node kinds stored in the arena: function nodes that
//! carry an `Op`, and leaf nodes that deliver gradients to an external
//! accumulation target.

use parking_lot::RwLock;
use smallvec::SmallVec;

use rune_core::{OpError, Value};

use crate::graph::NodeId;

/// Consumer→producer edge: the direction gradients flow during backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// The node that produced this input during the forward pass.
    pub producer: NodeId,
    /// Which of the producer's output slots fed this input.
    pub output: usize,
}

/// A differentiable operation's backward computation.
///
/// Implemented once per operation kind; the scheduler treats it as opaque.
/// `apply` receives one gradient per output slot of the node (`None` for
/// slots that never received a gradient — not a zero-filled value) and must
/// return one gradient per input edge, in edge order. `retain_graph` is
/// forwarded from the traversal so implementations may release saved
/// forward-pass state on the final pass.
pub trait Op<V: Value>: Send + Sync {
    fn apply(
        &self,
        grads: &[Option<V>],
        retain_graph: bool,
    ) -> Result<Vec<Option<V>>, OpError>;

    /// Name of this operation (for diagnostics).
    fn name(&self) -> &str;
}

/// Closures work as operations directly; handy for tests and small ops.
impl<V, F> Op<V> for F
where
    V: Value,
    F: Fn(&[Option<V>], bool) -> Result<Vec<Option<V>>, OpError> + Send + Sync,
{
    fn apply(
        &self,
        grads: &[Option<V>],
        retain_graph: bool,
    ) -> Result<Vec<Option<V>>, OpError> {
        (self)(grads, retain_graph)
    }

    fn name(&self) -> &str {
        "closure"
    }
}

type Hook<V> = Box<dyn Fn(&V) + Send + Sync>;

/// A recorded operation: the unit the scheduler dispatches.
pub(crate) struct FunctionNode<V: Value> {
    pub op: Box<dyn Op<V>>,
    pub edges: SmallVec<[Edge; 2]>,
    pub num_outputs: usize,
    pub requires_grad: bool,
    /// Stochastic class: scheduled immediately upon discovery, bypassing
    /// dependency counting.
    pub always_ready: bool,
}

/// A terminal node. Its gradient destination is outside the graph: an
/// accumulation slot read back via `Graph::grad`, plus registered hooks.
pub(crate) struct LeafNode<V: Value> {
    pub requires_grad: bool,
    pub grad: RwLock<Option<V>>,
    pub hooks: RwLock<Vec<Hook<V>>>,
}

impl<V: Value> LeafNode<V> {
    pub fn new(requires_grad: bool) -> Self {
        Self {
            requires_grad,
            grad: RwLock::new(None),
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Deliver a gradient to the external target.
    ///
    /// Hooks observe the delivered value before accumulation. The scheduler
    /// coalesces per-consumer contributions and delivers once per traversal,
    /// so hooks see the summed gradient.
    pub fn accumulate_external(&self, grad: &V) {
        for hook in self.hooks.read().iter() {
            hook(grad);
        }
        let mut slot = self.grad.write();
        match slot.as_mut() {
            Some(existing) => existing.accumulate(grad),
            None => *slot = Some(grad.clone()),
        }
    }
}

pub(crate) enum Node<V: Value> {
    Function(FunctionNode<V>),
    Leaf(LeafNode<V>),
}

impl<V: Value> Node<V> {
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub fn requires_grad(&self) -> bool {
        match self {
            Node::Function(f) => f.requires_grad,
            Node::Leaf(l) => l.requires_grad,
        }
    }

    pub fn op_name(&self) -> &str {
        match self {
            Node::Function(f) => f.op.name(),
            Node::Leaf(_) => "Leaf",
        }
    }
}
