//! The gradient value abstraction.
//!
//! The engine never looks inside a gradient: it only clones a value when a
//! buffer slot must stop aliasing data some other party still holds, and
//! adds values together when multiple consumers feed the same producer slot.
//! Tensor math lives entirely behind this trait.

/// A gradient value flowing through the backward graph.
///
/// `Clone` must produce a value that is safe to mutate independently of the
/// original — a deep copy for handle types with shared storage. The engine
/// relies on this when it converts a shared buffer slot into an owned one
/// before accumulating in place.
pub trait Value: Clone + Send + Sync + 'static {
    /// In-place elementwise accumulation: `self += other`.
    fn accumulate(&mut self, other: &Self);
}

impl Value for f32 {
    fn accumulate(&mut self, other: &Self) {
        *self += *other;
    }
}

impl Value for f64 {
    fn accumulate(&mut self, other: &Self) {
        *self += *other;
    }
}

/// Elementwise accumulation over same-length vectors.
impl<T: Value> Value for Vec<T> {
    fn accumulate(&mut self, other: &Self) {
        assert_eq!(
            self.len(),
            other.len(),
            "gradient length mismatch: {} vs {}",
            self.len(),
            other.len()
        );
        for (a, b) in self.iter_mut().zip(other.iter()) {
            a.accumulate(b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_accumulate() {
        let mut a = 1.5f32;
        a.accumulate(&2.5);
        assert_eq!(a, 4.0);

        let mut b = 1.0f64;
        b.accumulate(&-3.0);
        assert_eq!(b, -2.0);
    }

    #[test]
    fn test_vec_accumulate() {
        let mut a = vec![1.0f32, 2.0, 3.0];
        a.accumulate(&vec![10.0, 20.0, 30.0]);
        assert_eq!(a, vec![11.0, 22.0, 33.0]);
    }

    #[test]
    #[should_panic(expected = "gradient length mismatch")]
    fn test_vec_accumulate_length_mismatch() {
        let mut a = vec![1.0f32, 2.0];
        a.accumulate(&vec![1.0]);
    }
}
