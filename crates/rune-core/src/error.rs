//! Errors surfaced by a backward traversal.
//!
//! Every variant is fatal: the traversal aborts, no partial-success state is
//! exposed, and nothing is retried (a backward computation whose in-place
//! side effects already ran cannot be replayed safely). Variants carry the
//! arena index and operation name of the failing node where one exists.

/// Error returned by an operation's backward computation.
///
/// Operations are opaque to the engine, so this is a plain message wrapper;
/// the engine attaches node identity when it propagates the failure as
/// [`GraphError::ComputationFailed`].
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct OpError(pub String);

impl OpError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// A failed backward traversal.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// A dependency count dropped below zero. Indicates a bug in the graph
    /// builder or a cycle; scheduling past this point would be unsound.
    #[error("dependency count is negative for node {node} ({op})")]
    NegativeDependency { node: usize, op: String },

    /// No leaf and no function node reachable from the roots requires grad.
    #[error("there are no graph nodes that require computing gradients")]
    NoPathRequiresGrad,

    /// The traversal drained but some nodes never saw their dependency
    /// count reach zero. Reports the stuck nodes.
    #[error("could not compute gradients for some nodes ({})", .nodes.join(", "))]
    UnresolvedNodes { nodes: Vec<String> },

    /// A backward computation returned a gradient count that does not match
    /// the node's declared input-edge count.
    #[error(
        "backward of node {node} ({op}) returned {got} gradients, expected {expected}"
    )]
    MalformedBackward {
        node: usize,
        op: String,
        expected: usize,
        got: usize,
    },

    /// A backward computation failed; wraps the inner error.
    #[error("backward of node {node} ({op}) failed")]
    ComputationFailed {
        node: usize,
        op: String,
        #[source]
        source: OpError,
    },

    /// A second traversal was attempted over a graph whose buffers were
    /// consumed by an earlier pass without `retain_graph`.
    #[error("graph was already consumed by a backward pass without retain_graph")]
    GraphConsumed,

    /// Root and initial-gradient collections differ in length.
    #[error("got {roots} roots and {grads} initial gradients")]
    RootCountMismatch { roots: usize, grads: usize },
}
