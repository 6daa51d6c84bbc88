//! End-to-end backward traversals over hand-built graphs.
//! Run with: cargo test -p rune-autograd -- --nocapture

use rune_autograd::{run_backward, run_backward_split, Graph, NoGradGuard, Op};
use rune_core::{GraphError, OpError};

/// Unary op: forwards `k` times the gradient arriving on slot 0.
struct Scale {
    k: f32,
    name: &'static str,
}

impl Op<f32> for Scale {
    fn apply(&self, grads: &[Option<f32>], _retain: bool) -> Result<Vec<Option<f32>>, OpError> {
        Ok(vec![grads[0].map(|g| g * self.k)])
    }

    fn name(&self) -> &str {
        self.name
    }
}

fn scale(k: f32, name: &'static str) -> Box<Scale> {
    Box::new(Scale { k, name })
}

/// Root-like op: forwards slot 0 unchanged to each of its input edges.
struct Fanout {
    edges: usize,
}

impl Op<f32> for Fanout {
    fn apply(&self, grads: &[Option<f32>], _retain: bool) -> Result<Vec<Option<f32>>, OpError> {
        Ok(vec![grads[0]; self.edges])
    }

    fn name(&self) -> &str {
        "FanoutBackward"
    }
}

fn fanout(edges: usize) -> Box<Fanout> {
    Box::new(Fanout { edges })
}

// ============================================================================
// Accumulation and traversal shape
// ============================================================================

#[test]
fn test_diamond_sums_both_paths_into_leaf() {
    // a -> b, a -> c, b -> d, c -> d; backward from d.
    let mut g = Graph::<f32>::new();
    let a = g.leaf(true);
    let b = g.apply(scale(2.0, "ScaleBy2"), &[a], 1);
    let c = g.apply(scale(3.0, "ScaleBy3"), &[a], 1);
    let d = g.apply(fanout(2), &[b[0], c[0]], 1);

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    g.register_hook(&a, move |grad: &f32| {
        assert_eq!(*grad, 5.0);
        seen.fetch_add(1, Ordering::SeqCst);
    });

    run_backward(&g, vec![(d[0], 1.0)], false).unwrap();
    assert_eq!(g.grad(&a), Some(5.0));
    // Both paths coalesce into a single delivery.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_fan_in_accumulates_every_consumer() {
    let mut g = Graph::<f32>::new();
    let leaf = g.leaf(true);
    let p = g.apply(scale(1.0, "Inner"), &[leaf], 1);
    let c1 = g.apply(scale(1.0, "C1"), &[p[0]], 1);
    let c2 = g.apply(scale(2.0, "C2"), &[p[0]], 1);
    let c3 = g.apply(scale(3.0, "C3"), &[p[0]], 1);
    let c4 = g.apply(scale(4.0, "C4"), &[p[0]], 1);
    let root = g.apply(fanout(4), &[c1[0], c2[0], c3[0], c4[0]], 1);

    run_backward(&g, vec![(root[0], 1.0)], false).unwrap();
    assert_eq!(g.grad(&leaf), Some(10.0));
}

#[test]
fn test_unconsumed_output_slot_stays_none() {
    struct TwoOut;
    impl Op<f32> for TwoOut {
        fn apply(
            &self,
            grads: &[Option<f32>],
            _retain: bool,
        ) -> Result<Vec<Option<f32>>, OpError> {
            assert_eq!(grads.len(), 2);
            assert!(grads[0].is_none(), "slot 0 has no consumer");
            Ok(vec![grads[1]])
        }
        fn name(&self) -> &str {
            "TwoOutBackward"
        }
    }

    let mut g = Graph::<f32>::new();
    let leaf = g.leaf(true);
    let m = g.apply(Box::new(TwoOut), &[leaf], 2);
    let root = g.apply(scale(1.0, "Consumer"), &[m[1]], 1);

    run_backward(&g, vec![(root[0], 4.0)], false).unwrap();
    assert_eq!(g.grad(&leaf), Some(4.0));
}

#[test]
fn test_leaf_as_root_delivers_directly() {
    let mut g = Graph::<f32>::new();
    let leaf = g.leaf(true);
    run_backward(&g, vec![(leaf, 3.0)], false).unwrap();
    assert_eq!(g.grad(&leaf), Some(3.0));
}

#[test]
fn test_op_may_skip_an_input() {
    // The op returns no gradient for its second input; the skipped leaf
    // keeps an empty grad slot and the traversal still succeeds.
    struct FirstOnly;
    impl Op<f32> for FirstOnly {
        fn apply(
            &self,
            grads: &[Option<f32>],
            _retain: bool,
        ) -> Result<Vec<Option<f32>>, OpError> {
            Ok(vec![grads[0], None])
        }
        fn name(&self) -> &str {
            "FirstOnlyBackward"
        }
    }

    let mut g = Graph::<f32>::new();
    let x = g.leaf(true);
    let y = g.leaf(true);
    let out = g.apply(Box::new(FirstOnly), &[x, y], 1);

    run_backward(&g, vec![(out[0], 2.0)], false).unwrap();
    assert_eq!(g.grad(&x), Some(2.0));
    assert_eq!(g.grad(&y), None);
}

// ============================================================================
// Retain semantics
// ============================================================================

#[test]
fn test_retain_graph_allows_repeated_passes() {
    let mut g = Graph::<f32>::new();
    let leaf = g.leaf(true);
    let out = g.apply(scale(2.0, "ScaleBy2"), &[leaf], 1);

    g.backward(vec![(out[0], 1.0)], true).unwrap();
    g.backward(vec![(out[0], 1.0)], true).unwrap();
    assert_eq!(g.grad(&leaf), Some(4.0));

    // Final pass without retain consumes the graph.
    g.backward(vec![(out[0], 1.0)], false).unwrap();
    assert_eq!(g.grad(&leaf), Some(6.0));

    match g.backward(vec![(out[0], 1.0)], true) {
        Err(GraphError::GraphConsumed) => {}
        other => panic!("expected GraphConsumed, got {other:?}"),
    }
}

#[test]
fn test_retain_flag_reaches_operations() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct SeesRetain {
        final_passes: Arc<AtomicUsize>,
    }
    impl Op<f32> for SeesRetain {
        fn apply(&self, grads: &[Option<f32>], retain: bool) -> Result<Vec<Option<f32>>, OpError> {
            if !retain {
                self.final_passes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(vec![grads[0]])
        }
        fn name(&self) -> &str {
            "SeesRetainBackward"
        }
    }

    let final_passes = Arc::new(AtomicUsize::new(0));
    let mut g = Graph::<f32>::new();
    let leaf = g.leaf(true);
    let out = g.apply(
        Box::new(SeesRetain {
            final_passes: final_passes.clone(),
        }),
        &[leaf],
        1,
    );

    g.backward(vec![(out[0], 1.0)], true).unwrap();
    assert_eq!(final_passes.load(Ordering::SeqCst), 0);
    g.backward(vec![(out[0], 1.0)], false).unwrap();
    assert_eq!(final_passes.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Grad mode
// ============================================================================

#[test]
fn test_untracked_recording_yields_no_grad_path() {
    let mut g = Graph::<f32>::new();
    let leaf = g.leaf(true);
    let out = {
        let _guard = NoGradGuard::new();
        g.apply(scale(2.0, "Untracked"), &[leaf], 1)
    };

    match run_backward(&g, vec![(out[0], 1.0)], false) {
        Err(GraphError::NoPathRequiresGrad) => {}
        other => panic!("expected NoPathRequiresGrad, got {other:?}"),
    }
    assert_eq!(g.grad(&leaf), None);
}

#[test]
fn test_no_grad_required_anywhere() {
    let mut g = Graph::<f32>::new();
    let leaf = g.leaf(false);
    let out = g.apply(scale(2.0, "ScaleBy2"), &[leaf], 1);

    match run_backward(&g, vec![(out[0], 1.0)], false) {
        Err(GraphError::NoPathRequiresGrad) => {}
        other => panic!("expected NoPathRequiresGrad, got {other:?}"),
    }
}

// ============================================================================
// Failure propagation
// ============================================================================

#[test]
fn test_failed_operation_names_the_node() {
    struct Failing;
    impl Op<f32> for Failing {
        fn apply(
            &self,
            _grads: &[Option<f32>],
            _retain: bool,
        ) -> Result<Vec<Option<f32>>, OpError> {
            Err(OpError::new("saved buffers released"))
        }
        fn name(&self) -> &str {
            "ExpBackward"
        }
    }

    let mut g = Graph::<f32>::new();
    let leaf = g.leaf(true);
    let out = g.apply(Box::new(Failing), &[leaf], 1);

    match run_backward(&g, vec![(out[0], 1.0)], false) {
        Err(GraphError::ComputationFailed { op, source, .. }) => {
            assert_eq!(op, "ExpBackward");
            assert_eq!(source.to_string(), "saved buffers released");
        }
        other => panic!("expected ComputationFailed, got {other:?}"),
    }
    // Nothing was delivered to the leaf.
    assert_eq!(g.grad(&leaf), None);
}

#[test]
fn test_wrong_gradient_count_is_malformed() {
    struct WrongArity;
    impl Op<f32> for WrongArity {
        fn apply(
            &self,
            _grads: &[Option<f32>],
            _retain: bool,
        ) -> Result<Vec<Option<f32>>, OpError> {
            Ok(Vec::new())
        }
        fn name(&self) -> &str {
            "BrokenBackward"
        }
    }

    let mut g = Graph::<f32>::new();
    let leaf = g.leaf(true);
    let out = g.apply(Box::new(WrongArity), &[leaf], 1);

    match run_backward(&g, vec![(out[0], 1.0)], false) {
        Err(GraphError::MalformedBackward {
            op, expected, got, ..
        }) => {
            assert_eq!(op, "BrokenBackward");
            assert_eq!(expected, 1);
            assert_eq!(got, 0);
        }
        other => panic!("expected MalformedBackward, got {other:?}"),
    }
}

#[test]
fn test_split_roots_reject_length_mismatch() {
    let mut g = Graph::<f32>::new();
    let leaf = g.leaf(true);
    let out = g.apply(scale(1.0, "ScaleBy1"), &[leaf], 1);

    match run_backward_split(&g, &[out[0]], vec![1.0, 2.0], false) {
        Err(GraphError::RootCountMismatch { roots, grads }) => {
            assert_eq!(roots, 1);
            assert_eq!(grads, 2);
        }
        other => panic!("expected RootCountMismatch, got {other:?}"),
    }
}

// ============================================================================
// Vector-valued gradients
// ============================================================================

#[test]
fn test_vector_values_accumulate_elementwise() {
    struct Pass;
    impl Op<Vec<f32>> for Pass {
        fn apply(
            &self,
            grads: &[Option<Vec<f32>>],
            _retain: bool,
        ) -> Result<Vec<Option<Vec<f32>>>, OpError> {
            Ok(vec![grads[0].clone(), grads[0].clone()])
        }
        fn name(&self) -> &str {
            "PassBackward"
        }
    }

    let mut g = Graph::<Vec<f32>>::new();
    let x = g.leaf(true);
    let y = g.leaf(true);
    let out = g.apply(Box::new(Pass), &[x, y], 1);

    run_backward(&g, vec![(out[0], vec![1.0, 2.0])], false).unwrap();
    assert_eq!(g.grad(&x), Some(vec![1.0, 2.0]));
    assert_eq!(g.grad(&y), Some(vec![1.0, 2.0]));
}
