//! The invocation stack: one frame per nested entry from the engine.
//!
//! The engine keeps the current nesting level in the call-frame window. The
//! bridge keeps a table indexed by that level, creating a frame the first time
//! anything asks for [`Invocation::current`] at a level and dropping it when
//! the engine reports the level has returned.
//!
//! Each level goes through `absent → active → exiting → absent`. While a frame
//! is exiting (its savepoint being resolved, its lifespan being ended), asking
//! for the current invocation at that level is a usage error.
use crate::context::{self, Bridge};
use crate::error::{Result, UsageError};
use crate::lifespan::Lifespan;
use crate::savepoint::Savepoint;
use crate::sys::{NativeError, NativeHandle};
use crate::util::Defer;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Active,
    Exiting,
}

struct Frame {
    level: u32,
    phase: Cell<Phase>,
    savepoint: RefCell<Option<Savepoint>>,
    lifespan: Lifespan,
}

/// One live call frame.
#[derive(Clone)]
pub struct Invocation(Rc<Frame>);

#[derive(Default)]
pub(crate) struct InvocationTable {
    frames: Vec<Option<Invocation>>,
}

impl InvocationTable {
    fn get(&self, level: u32) -> Option<&Invocation> {
        self.frames.get(level as usize).and_then(Option::as_ref)
    }

    fn insert(&mut self, invocation: Invocation) {
        let index = invocation.0.level as usize;
        if index >= self.frames.len() {
            self.frames.resize((index + 1).next_power_of_two(), None);
        }
        self.frames[index] = Some(invocation);
    }

    /// The frames at `level` and above, deepest first.
    fn from_level(&self, level: u32) -> Vec<Invocation> {
        let start = (level as usize).min(self.frames.len());
        self.frames[start..].iter().rev().flatten().cloned().collect()
    }

    fn truncate(&mut self, level: u32) {
        let start = (level as usize).min(self.frames.len());
        self.frames[start..].fill(None);
    }
}

impl Invocation {
    /// The frame for the engine's present nesting level, created on first
    /// request.
    pub fn current() -> Result<Invocation> {
        let bridge = context::bridge()?;
        let level = bridge.nesting_level();
        Self::at_level(&bridge, level)
    }

    pub(crate) fn at_level(bridge: &Bridge, level: u32) -> Result<Invocation> {
        let mut table = bridge.invocations.borrow_mut();
        if let Some(existing) = table.get(level) {
            return match existing.0.phase.get() {
                Phase::Active => Ok(existing.clone()),
                Phase::Exiting => Err(UsageError::ReentrantExit { level }.into()),
            };
        }
        let parent = (0..level).rev().find_map(|l| table.get(l)).map(|i| i.0.lifespan.clone());
        let invocation = Invocation(Rc::new(Frame {
            level,
            phase: Cell::new(Phase::Active),
            savepoint: RefCell::new(None),
            lifespan: Lifespan::for_invocation(level, parent.as_ref()),
        }));
        table.insert(invocation.clone());
        Ok(invocation)
    }

    pub fn level(&self) -> u32 {
        self.0.level
    }

    /// The lifespan ended when this frame returns to the engine.
    pub fn lifespan(&self) -> &Lifespan {
        &self.0.lifespan
    }

    /// The outermost savepoint set during this invocation and still open.
    pub fn savepoint(&self) -> Option<Savepoint> {
        self.0.savepoint.borrow().clone()
    }

    pub fn is_exiting(&self) -> bool {
        self.0.phase.get() == Phase::Exiting
    }

    /// Records `savepoint` unless an outer one is already recorded; rolling
    /// back the outer one takes the inner ones with it.
    pub(crate) fn adopt_savepoint(&self, savepoint: &Savepoint) {
        let mut slot = self.0.savepoint.borrow_mut();
        if slot.is_none() {
            *slot = Some(savepoint.clone());
        }
    }

    pub(crate) fn forget_savepoint(&self, savepoint: &Savepoint) {
        let mut slot = self.0.savepoint.borrow_mut();
        if slot.as_ref().is_some_and(|s| s.ptr_eq(savepoint)) {
            *slot = None;
        }
    }

    pub(crate) fn lookup(bridge: &Bridge, level: u32) -> Option<Invocation> {
        bridge.invocations.borrow().get(level).cloned()
    }

    /// The memory context of the engine code that made this call.
    pub fn upper_context() -> Result<NativeHandle> {
        Ok(context::bridge()?.upper_context())
    }

    /// The engine's error-occurred flag.
    pub fn error_occurred() -> Result<bool> {
        Ok(context::bridge()?.error_flag())
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("level", &self.0.level)
            .field("phase", &self.0.phase.get())
            .field("savepoint", &self.0.savepoint.borrow())
            .finish()
    }
}

/// Pops the frame at `level` and any deeper one still present.
///
/// Open savepoints are resolved first, deepest frame first. A pending engine
/// error counts as an error exit, so those savepoints are rolled back. Whatever
/// the resolution does, the frames' lifespans end afterwards, so every state
/// scoped to them is released.
pub(crate) fn on_exit(bridge: &Bridge, level: u32, with_error: bool) -> Result<()> {
    let exiting = bridge.invocations.borrow().from_level(level);
    for frame in &exiting {
        frame.0.phase.set(Phase::Exiting);
    }

    // frames stay in the table, exiting, until their lifespans have ended
    let _release = Defer::new(|| {
        for frame in &exiting {
            frame.0.lifespan.end(bridge);
        }
        bridge.invocations.borrow_mut().truncate(level);
    });

    if !with_error {
        if let Some(err) = bridge.pending_error.borrow().as_ref() {
            tracing::warn!(
                level,
                error = %err,
                "invocation returned normally with an engine error caught but not resolved"
            );
        }
    }

    let mut resolution = Ok(());
    for frame in &exiting {
        let open = frame.0.savepoint.borrow_mut().take();
        let Some(savepoint) = open else { continue };
        let failed = with_error || bridge.pending_error.borrow().is_some() || bridge.error_flag();
        let resolved = savepoint.on_invocation_exit(bridge, failed);
        if resolution.is_ok() {
            resolution = resolved;
        } else if let Err(err) = resolved {
            tracing::warn!(level = frame.0.level, error = %err, "resolving savepoint at exit failed");
        }
    }
    resolution
}

/// Slots in the invocation table; always zero or a power of two.
pub fn table_capacity() -> Result<usize> {
    Ok(context::bridge()?.invocations.borrow().frames.len())
}

/// Clears the pending engine error and the engine's error flag.
///
/// Only call this once the error has really been resolved, e.g. by rolling
/// back the transaction or subtransaction it occurred in.
pub fn clear_error_condition() -> Result<()> {
    context::bridge()?.clear_error_condition();
    Ok(())
}

/// The unresolved engine error, if any.
pub fn pending_error() -> Result<Option<NativeError>> {
    Ok(context::bridge()?.pending_error.borrow().clone())
}

/// Takes the unresolved engine error, clearing the error condition, so the
/// host can rethrow it into the engine.
pub fn take_pending_error() -> Result<Option<NativeError>> {
    let bridge = context::bridge()?;
    let err = bridge.pending_error.borrow_mut().take();
    if err.is_some() {
        bridge.clear_error_condition();
    }
    Ok(err)
}
