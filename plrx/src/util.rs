//! Misc internal utilities.
//!
//! Nothing in here should be publically exposed.

/// Runs a closure when dropped, including while unwinding.
///
/// Exit-time bookkeeping (ending an invocation's lifespan, emptying the
/// savepoint nursery, restoring a security context) goes in one of these so it
/// happens no matter how the code in between leaves the scope.
pub(crate) struct Defer<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Defer<F> {
    #[inline]
    pub(crate) fn new(f: F) -> Self {
        Self(Some(f))
    }
}

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}
