//! # Lifespans
//!
//! This module reconciles the (otherwise incompatible) lifetime models of the
//! engine and of Rust code hosted inside it.
//!
//! The engine allocates its structures from nested, scope-bound arenas: memory
//! contexts and resource owners belonging to a transaction, a subtransaction or
//! a single call. When the scope ends, everything in it is freed at once,
//! whether or not anyone still points at it. Rust code, on the other hand,
//! frees things when their owner is dropped, on its own schedule. A Rust value
//! holding a pointer into an engine arena therefore needs to learn, somehow,
//! that the arena is gone.
//!
//! A [`Lifespan`] is the Rust-side stand-in for one such engine scope. It has a
//! single terminal transition ([`end`](Lifespan::end)), after which it never
//! becomes live again, and it keeps a list of every [`DualState`] registered
//! against it. Ending the lifespan invalidates all of them, so a later
//! [`pin`](DualState::pin) reports staleness instead of handing out a dangling
//! handle.
//!
//! ## Kinds
//!
//! - Native scopes ([`NativeScope`]): a resource owner or a memory context,
//!   identified by the engine's handle. The engine reports their end through
//!   [`hooks::lifespan_ended`](crate::hooks::lifespan_ended).
//! - Invocation scopes: one per call frame, ended by the bridge itself when the
//!   engine reports that the frame returned.
//!
//! Lifespans nest. A child always ends before (or together with) its parent;
//! ending a parent ends any children still live first.
//!
//! ## Bookkeeping
//!
//! The lifespan holds its registered states strongly, but never the Rust
//! value that owns the `DualState`. The owner can be dropped at any time, and
//! once a state is invalidated its entry is removed here, so nothing keeps the
//! bookkeeping alive longer than the native structure it guards.
//!
//! [`DualState`]: crate::dual_state::DualState
//! [`DualState::pin`]: crate::dual_state::DualState::pin
use crate::context::{self, Bridge};
use crate::dual_state::{ReleaseCause, StateCore};
use crate::error::{BridgeError, Result};
use crate::invocation::Invocation;
use crate::sys::NativeHandle;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// An engine scope whose end the engine reports by handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NativeScope {
    ResourceOwner(NativeHandle),
    MemoryContext(NativeHandle),
}

impl NativeScope {
    pub fn handle(self) -> NativeHandle {
        match self {
            NativeScope::ResourceOwner(h) | NativeScope::MemoryContext(h) => h,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LifespanKind {
    Native(NativeScope),
    Invocation(u32),
}

impl fmt::Display for LifespanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifespanKind::Native(NativeScope::ResourceOwner(h)) => write!(f, "resource owner {h}"),
            LifespanKind::Native(NativeScope::MemoryContext(h)) => write!(f, "memory context {h}"),
            LifespanKind::Invocation(level) => write!(f, "invocation at level {level}"),
        }
    }
}

/// A scope bounding how long native handles registered against it stay valid.
#[derive(Clone)]
pub struct Lifespan(pub(crate) Rc<LifespanInner>);

pub(crate) struct LifespanInner {
    kind: LifespanKind,
    ended: Cell<bool>,
    children: RefCell<Vec<Weak<LifespanInner>>>,
    states: RefCell<BTreeMap<u64, Rc<StateCore>>>,
}

impl Lifespan {
    /// The lifespan of the current invocation.
    pub fn current() -> Result<Lifespan> {
        Ok(Invocation::current()?.lifespan().clone())
    }

    /// The lifespan standing in for `scope`, created on first request.
    ///
    /// `parent` only matters on creation: the new lifespan will end no later
    /// than `parent` does. Asking for a child of an ended lifespan is stale.
    pub fn native(scope: NativeScope, parent: Option<&Lifespan>) -> Result<Lifespan> {
        let bridge = context::bridge()?;
        if let Some(existing) = bridge.lifespans.borrow().get(&scope) {
            return Ok(existing.clone());
        }
        if parent.is_some_and(Lifespan::is_ended) {
            return Err(BridgeError::Stale { handle: scope.handle() });
        }
        let lifespan = Lifespan::new(LifespanKind::Native(scope), parent);
        bridge.lifespans.borrow_mut().insert(scope, lifespan.clone());
        Ok(lifespan)
    }

    pub(crate) fn for_invocation(level: u32, parent: Option<&Lifespan>) -> Lifespan {
        Lifespan::new(LifespanKind::Invocation(level), parent)
    }

    fn new(kind: LifespanKind, parent: Option<&Lifespan>) -> Lifespan {
        let inner = Rc::new(LifespanInner {
            kind,
            ended: Cell::new(false),
            children: RefCell::default(),
            states: RefCell::default(),
        });
        if let Some(parent) = parent {
            let mut children = parent.0.children.borrow_mut();
            children.retain(|child| child.strong_count() > 0);
            children.push(Rc::downgrade(&inner));
        }
        Lifespan(inner)
    }

    pub fn kind(&self) -> LifespanKind {
        self.0.kind
    }

    pub fn is_ended(&self) -> bool {
        self.0.ended.get()
    }

    /// Number of states registered and not yet invalidated.
    pub fn live_states(&self) -> usize {
        self.0.states.borrow().len()
    }

    pub fn ptr_eq(&self, other: &Lifespan) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn downgrade(&self) -> Weak<LifespanInner> {
        Rc::downgrade(&self.0)
    }

    pub(crate) fn enlist(&self, id: u64, state: Rc<StateCore>) -> Result<()> {
        if self.is_ended() {
            return Err(BridgeError::Stale { handle: state.handle() });
        }
        self.0.states.borrow_mut().insert(id, state);
        Ok(())
    }

    /// Ends this lifespan: children first, then every registered state, most
    /// recently registered first. Ending twice does nothing.
    pub(crate) fn end(&self, bridge: &Bridge) {
        if self.0.ended.replace(true) {
            return;
        }

        let children = std::mem::take(&mut *self.0.children.borrow_mut());
        for child in children.iter().rev().filter_map(Weak::upgrade) {
            Lifespan(child).end(bridge);
        }

        // taken out first: releasing a state may reenter the bridge
        let states = std::mem::take(&mut *self.0.states.borrow_mut());
        tracing::debug!(lifespan = %self.0.kind, states = states.len(), "lifespan ended");
        for state in states.into_values().rev() {
            if let Err(err) = state.invalidate(ReleaseCause::LifespanEnded, bridge) {
                tracing::warn!(lifespan = %self.0.kind, error = %err, "releasing native state failed");
            }
        }

        if let LifespanKind::Native(scope) = self.0.kind {
            let mut registry = bridge.lifespans.borrow_mut();
            if registry.get(&scope).is_some_and(|l| l.ptr_eq(self)) {
                registry.remove(&scope);
            }
        }
    }
}

impl LifespanInner {
    pub(crate) fn delist(&self, id: u64) -> Option<Rc<StateCore>> {
        self.states.borrow_mut().remove(&id)
    }
}

impl fmt::Debug for Lifespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifespan")
            .field("kind", &self.0.kind)
            .field("ended", &self.0.ended.get())
            .field("live_states", &self.live_states())
            .finish()
    }
}
