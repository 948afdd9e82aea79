//! Rust-side proxies for engine structures.
//!
//! A [`DualState`] couples one [`NativeHandle`] to the [`Lifespan`] that
//! governs it. The structure behind the handle may go away in two ways: the
//! Rust side lets go of it (by calling [`release`](DualState::release) or by
//! dropping the `DualState`), or the engine ends the scope it lives in. The
//! first of the two to happen invalidates the state, and its release action
//! runs exactly once.
//!
//! The handle itself is only reachable through [`pin`](DualState::pin), which
//! fails with [`BridgeError::Stale`] once the state is invalid. While a pin is
//! held, an invalidation that arrives reentrantly (say, the engine aborts a
//! subtransaction from inside a call made while pinned) is recorded but the
//! release action waits until the last pin is dropped.
use crate::context::{self, Bridge};
use crate::error::{BridgeError, Result};
use crate::lifespan::{Lifespan, LifespanInner};
use crate::sys::{NativeHandle, NativeRelease};
use bitflags::bitflags;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    struct Flags: u8 {
        const INVALID = 1;
        const RELEASE_DEFERRED = 1 << 1;
        const LEFT_TO_LIFESPAN = 1 << 2;
    }
}

/// What invalidated a state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReleaseCause {
    /// [`DualState::release`] was called.
    Managed,
    /// The `DualState` was dropped while still valid.
    Unreachable,
    /// The governing lifespan ended; the engine has already freed (or is about
    /// to free) the structure.
    LifespanEnded,
}

/// Passed to a release action.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Released {
    pub handle: NativeHandle,
    pub cause: ReleaseCause,
}

impl Released {
    /// Whether the engine structure still exists, so the action should free it.
    pub fn native_live(&self) -> bool {
        self.cause != ReleaseCause::LifespanEnded
    }
}

/// What to do with the native structure once the state is invalidated.
pub enum OnRelease {
    /// Guard only: the engine frees the structure with its scope.
    Nothing,
    /// Free it with an engine routine, if it is still live.
    Native(NativeRelease),
    Custom(Box<dyn FnOnce(Released)>),
}

impl fmt::Debug for OnRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnRelease::Nothing => f.write_str("Nothing"),
            OnRelease::Native(kind) => f.debug_tuple("Native").field(kind).finish(),
            OnRelease::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Counters kept by the bridge, see [`crate::statistics`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    pub constructed: u64,
    pub released_managed: u64,
    pub released_unreachable: u64,
    pub released_lifespan: u64,
    pub deferred: u64,
    pub stale_pins: u64,
}

pub(crate) struct StateCore {
    id: u64,
    handle: NativeHandle,
    lifespan: Weak<LifespanInner>,
    pins: Cell<u32>,
    flags: Cell<Flags>,
    cause: Cell<Option<ReleaseCause>>,
    on_release: RefCell<Option<OnRelease>>,
}

impl StateCore {
    pub(crate) fn handle(&self) -> NativeHandle {
        self.handle
    }

    fn is_invalid(&self) -> bool {
        self.flags.get().contains(Flags::INVALID)
    }

    fn set_flag(&self, flag: Flags, on: bool) {
        let mut flags = self.flags.get();
        flags.set(flag, on);
        self.flags.set(flags);
    }

    /// The single invalidating transition. Later calls are no-ops.
    pub(crate) fn invalidate(&self, cause: ReleaseCause, bridge: &Bridge) -> Result<()> {
        if self.is_invalid() {
            return Ok(());
        }
        self.set_flag(Flags::INVALID, true);
        self.cause.set(Some(cause));

        if cause != ReleaseCause::LifespanEnded {
            if let Some(lifespan) = self.lifespan.upgrade() {
                lifespan.delist(self.id);
            }
        }
        bridge.count(|s| match cause {
            ReleaseCause::Managed => s.released_managed += 1,
            ReleaseCause::Unreachable => s.released_unreachable += 1,
            ReleaseCause::LifespanEnded => s.released_lifespan += 1,
        });

        if self.pins.get() > 0 {
            self.set_flag(Flags::RELEASE_DEFERRED, true);
            bridge.count(|s| s.deferred += 1);
            return Ok(());
        }
        self.run_release(bridge)
    }

    fn run_release(&self, bridge: &Bridge) -> Result<()> {
        let Some(action) = self.on_release.borrow_mut().take() else {
            return Ok(());
        };
        let released = Released {
            handle: self.handle,
            cause: self.cause.get().unwrap_or(ReleaseCause::LifespanEnded),
        };
        match action {
            OnRelease::Nothing => Ok(()),
            OnRelease::Native(kind) if released.native_live() => {
                bridge.call_native_resolving(|backend| backend.release_native(kind, released.handle))
            }
            OnRelease::Native(_) => Ok(()),
            OnRelease::Custom(f) => {
                f(released);
                Ok(())
            }
        }
    }

    fn unpin(&self) {
        let pins = self.pins.get().saturating_sub(1);
        self.pins.set(pins);
        if pins > 0 || !self.flags.get().contains(Flags::RELEASE_DEFERRED) {
            return;
        }
        self.set_flag(Flags::RELEASE_DEFERRED, false);
        match context::bridge().and_then(|bridge| self.run_release(&bridge)) {
            Ok(()) => {}
            Err(err) => tracing::warn!(handle = %self.handle, error = %err, "deferred release failed"),
        }
    }
}

/// A native handle whose validity is tied to a [`Lifespan`].
///
/// Dropping a valid `DualState` releases it with [`ReleaseCause::Unreachable`].
pub struct DualState {
    core: Rc<StateCore>,
}

impl DualState {
    /// Registers `handle` against `lifespan`. Fails with [`BridgeError::Stale`]
    /// if the lifespan has already ended.
    pub fn new(handle: NativeHandle, lifespan: &Lifespan, on_release: OnRelease) -> Result<Self> {
        let bridge = context::bridge()?;
        let id = bridge.next_state_id();
        let core = Rc::new(StateCore {
            id,
            handle,
            lifespan: lifespan.downgrade(),
            pins: Cell::new(0),
            flags: Cell::default(),
            cause: Cell::new(None),
            on_release: RefCell::new(Some(on_release)),
        });
        lifespan.enlist(id, Rc::clone(&core))?;
        bridge.count(|s| s.constructed += 1);
        Ok(DualState { core })
    }

    pub fn guarded(handle: NativeHandle, lifespan: &Lifespan) -> Result<Self> {
        Self::new(handle, lifespan, OnRelease::Nothing)
    }

    pub fn native(handle: NativeHandle, lifespan: &Lifespan, kind: NativeRelease) -> Result<Self> {
        Self::new(handle, lifespan, OnRelease::Native(kind))
    }

    pub fn with_release(
        handle: NativeHandle,
        lifespan: &Lifespan,
        f: impl FnOnce(Released) + 'static,
    ) -> Result<Self> {
        Self::new(handle, lifespan, OnRelease::Custom(Box::new(f)))
    }

    /// Guards the handle against invalidation until the returned pin drops.
    pub fn pin(&self) -> Result<Pinned<'_>> {
        if self.core.is_invalid() {
            if let Ok(bridge) = context::bridge() {
                bridge.count(|s| s.stale_pins += 1);
            }
            return Err(BridgeError::Stale { handle: self.core.handle });
        }
        self.core.pins.set(self.core.pins.get() + 1);
        Ok(Pinned { core: &self.core })
    }

    /// Pins unless the state has already been released.
    pub fn try_pin(&self) -> Option<Pinned<'_>> {
        self.pin().ok()
    }

    /// Releases the state now, without waiting for its lifespan to end.
    ///
    /// Calling this again, or after the lifespan has ended, does nothing.
    pub fn release(&self) -> Result<()> {
        let bridge = context::bridge()?;
        self.core.invalidate(ReleaseCause::Managed, &bridge)
    }

    /// Gives up the Rust side's interest: the state stays registered until its
    /// lifespan ends and is released then.
    pub fn leave_to_lifespan(self) {
        self.core.set_flag(Flags::LEFT_TO_LIFESPAN, true);
    }

    pub fn is_valid(&self) -> bool {
        !self.core.is_invalid()
    }

    pub fn is_pinned(&self) -> bool {
        self.core.pins.get() > 0
    }

    pub fn release_cause(&self) -> Option<ReleaseCause> {
        self.core.cause.get()
    }

    /// The governing lifespan, unless nothing refers to it any more.
    pub fn lifespan(&self) -> Option<Lifespan> {
        self.core.lifespan.upgrade().map(Lifespan)
    }
}

impl Drop for DualState {
    fn drop(&mut self) {
        if self.core.flags.get().intersects(Flags::INVALID | Flags::LEFT_TO_LIFESPAN) {
            return;
        }
        let released = context::bridge()
            .and_then(|bridge| self.core.invalidate(ReleaseCause::Unreachable, &bridge));
        if let Err(err) = released {
            tracing::warn!(handle = %self.core.handle, error = %err, "releasing unreachable state failed");
        }
    }
}

impl fmt::Debug for DualState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DualState")
            .field("handle", &self.core.handle)
            .field("valid", &self.is_valid())
            .field("pins", &self.core.pins.get())
            .finish()
    }
}

/// A pin on a [`DualState`]; the only way to read its handle.
#[must_use = "the handle is only guarded while the pin is held"]
pub struct Pinned<'a> {
    core: &'a StateCore,
}

impl Pinned<'_> {
    pub fn handle(&self) -> NativeHandle {
        self.core.handle
    }
}

impl Drop for Pinned<'_> {
    fn drop(&mut self) {
        self.core.unpin();
    }
}
