//! The privilege context code runs under.
//!
//! Listener callbacks run later than (and on behalf of) the code that
//! registered them, so the registry captures the context current at
//! registration and restores it around each callback.
use crate::util::Defer;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

#[derive(Clone, PartialEq, Eq)]
pub struct SecurityContext {
    user: Rc<str>,
    trusted: bool,
}

thread_local! {
    static CURRENT: RefCell<SecurityContext> = RefCell::new(SecurityContext::system());
}

impl SecurityContext {
    pub fn new(user: &str, trusted: bool) -> Self {
        Self { user: Rc::from(user), trusted }
    }

    /// The context in force when nothing more specific has been entered.
    pub fn system() -> Self {
        Self::new("", true)
    }

    pub fn current() -> Self {
        CURRENT.with(|current| current.borrow().clone())
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("user", &&*self.user)
            .field("trusted", &self.trusted)
            .finish()
    }
}

/// Runs `f` with `context` current, restoring the previous context after,
/// even if `f` panics.
pub fn with_context<R>(context: &SecurityContext, f: impl FnOnce() -> R) -> R {
    let previous = CURRENT.with(|current| current.replace(context.clone()));
    let _restore = Defer::new(move || {
        CURRENT.with(|current| current.replace(previous));
    });
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_contexts_restore_in_order() {
        let alice = SecurityContext::new("alice", false);
        let bob = SecurityContext::new("bob", true);
        with_context(&alice, || {
            assert_eq!(SecurityContext::current().user(), "alice");
            with_context(&bob, || assert_eq!(SecurityContext::current(), bob));
            assert_eq!(SecurityContext::current(), alice);
        });
        assert_eq!(SecurityContext::current(), SecurityContext::system());
    }
}
