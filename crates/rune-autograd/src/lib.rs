//! # rune-autograd
//!
//! Backward-pass graph engine for Rune.
//!
//! Provides a dependency-counted topological scheduler with:
//! - `Graph` arena of recorded operations and leaves, addressed by index
//! - `Op` trait for backward computations
//! - LIFO ready stack with per-invocation traversal state
//! - Copy-on-second-write gradient buffers for fan-in accumulation
//! - Stochastic (always-ready) node scheduling
//! - `NoGradGuard` scope for untracked recording

mod buffer;
pub mod engine;
pub mod graph;
pub mod node;
pub mod scope;

pub use engine::{run_backward, run_backward_split};
pub use graph::{Graph, NodeId, Var};
pub use node::{Edge, Op};
pub use scope::{is_grad_enabled, no_grad, NoGradGuard};
