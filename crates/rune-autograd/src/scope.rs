//! Grad-mode scopes.
//!
//! The graph builder consults a thread-local suppression depth when it
//! records an operation: while any `NoGradGuard` is live on the current
//! thread, recorded operations do not require grad and are invisible to
//! the backward scheduler. Leaves keep their flag regardless.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    /// Count of live guards on this thread. Grad mode is on only at depth
    /// zero, so nested guards carry no saved state to restore and may be
    /// dropped in any order.
    static SUPPRESS_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Whether operations recorded right now will be tracked for backward.
pub fn is_grad_enabled() -> bool {
    SUPPRESS_DEPTH.with(|d| d.get() == 0)
}

/// Run `f` with grad mode off, restoring it afterwards.
pub fn no_grad<R>(f: impl FnOnce() -> R) -> R {
    let _guard = NoGradGuard::new();
    f()
}

/// RAII guard that turns grad mode off for its scope.
///
/// The guard is bound to the thread it was created on and cannot be sent
/// across threads, since the depth it releases on drop is thread-local.
pub struct NoGradGuard {
    _thread_bound: PhantomData<*const ()>,
}

impl NoGradGuard {
    pub fn new() -> Self {
        SUPPRESS_DEPTH.with(|d| d.set(d.get() + 1));
        Self {
            _thread_bound: PhantomData,
        }
    }
}

impl Default for NoGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        SUPPRESS_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}
