//! Savepoints: named, rollback-capable checkpoints set during an invocation.
//!
//! Establishing a savepoint is a two-phase affair. The engine assigns the
//! identifier, but it may call back into the bridge with that identifier (to
//! deliver a subtransaction-start event, say) before the call that creates the
//! checkpoint has returned. So the savepoint is first published in a
//! single-slot *nursery*; an identifier lookup that finds nothing among the
//! known savepoints falls back to the nursery and assigns the identifier there.
//! The slot is emptied as soon as the creating call returns.
use crate::context::{self, Bridge};
use crate::error::{Result, UsageError};
use crate::invocation::Invocation;
use crate::sys::SubXactId;
use crate::util::Defer;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

#[derive(Clone)]
pub struct Savepoint(Rc<SavepointInner>);

struct SavepointInner {
    id: Cell<SubXactId>,
    name: Option<String>,
    /// The engine's transaction nest level of the checkpoint; `0` once it has
    /// been released or rolled back (or before it is established).
    nest_level: Cell<u32>,
    invocation_level: Cell<Option<u32>>,
    established: Cell<bool>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Resolution {
    Release,
    Rollback,
}

impl Savepoint {
    /// A provisional savepoint; nothing happens in the engine until
    /// [`establish`](Self::establish).
    pub fn new(name: Option<&str>) -> Savepoint {
        Savepoint(Rc::new(SavepointInner {
            id: Cell::new(SubXactId::INVALID),
            name: name.map(str::to_owned),
            nest_level: Cell::new(0),
            invocation_level: Cell::new(None),
            established: Cell::new(false),
        }))
    }

    /// Creates and establishes a savepoint in one step.
    pub fn set(name: Option<&str>) -> Result<Savepoint> {
        let savepoint = Savepoint::new(name);
        savepoint.establish()?;
        Ok(savepoint)
    }

    /// Asks the engine to open the checkpoint, attaching it to the current
    /// invocation.
    pub fn establish(&self) -> Result<()> {
        let bridge = context::bridge()?;
        if self.0.established.get() {
            return Err(UsageError::AlreadyEstablished.into());
        }
        let invocation = Invocation::current()?;

        {
            let mut nursery = bridge.savepoints.nursery.borrow_mut();
            if nursery.is_some() {
                return Err(UsageError::NurseryOccupied.into());
            }
            *nursery = Some(self.clone());
        }
        let _leave_nursery = Defer::new(|| {
            bridge.savepoints.nursery.borrow_mut().take();
        });

        let id = match bridge.call_native(|backend| backend.set_savepoint(self.name())) {
            Ok(id) => id,
            Err(err) => {
                self.0.id.set(SubXactId::INVALID);
                return Err(err);
            }
        };
        // normally assigned already, through the nursery
        self.0.id.set(id);
        self.0.nest_level.set(bridge.backend.transaction_nest_level());
        self.0.invocation_level.set(Some(invocation.level()));
        self.0.established.set(true);

        bridge.savepoints.known.borrow_mut().insert(id, self.clone());
        invocation.adopt_savepoint(self);
        tracing::debug!(savepoint = %self, nest_level = self.nest_level(), "savepoint established");
        Ok(())
    }

    /// The savepoint with engine identifier `id`, including one still being
    /// established.
    pub fn for_id(id: SubXactId) -> Result<Option<Savepoint>> {
        Ok(context::bridge()?.savepoints.lookup(id))
    }

    /// [`SubXactId::INVALID`] until established.
    pub fn id(&self) -> SubXactId {
        self.0.id.get()
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn nest_level(&self) -> u32 {
        self.0.nest_level.get()
    }

    /// Established and not yet released or rolled back.
    pub fn is_open(&self) -> bool {
        self.0.nest_level.get() != 0
    }

    pub fn ptr_eq(&self, other: &Savepoint) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn release(&self) -> Result<()> {
        self.resolve(&*context::bridge()?, Resolution::Release)
    }

    /// Rolls back to and discards the checkpoint. This resolves a pending
    /// engine error, so it is allowed while one is pending, and clears it.
    pub fn rollback(&self) -> Result<()> {
        self.resolve(&*context::bridge()?, Resolution::Rollback)
    }

    fn resolve(&self, bridge: &Bridge, how: Resolution) -> Result<()> {
        let id = self.id();
        if !id.is_valid() {
            return Err(UsageError::NotEstablished.into());
        }
        let nest_level = self.nest_level();
        if nest_level == 0 {
            return Ok(());
        }
        match how {
            Resolution::Release => {
                bridge.call_native(|backend| backend.release_savepoint(id, nest_level))?;
            }
            Resolution::Rollback => {
                bridge.call_native_resolving(|backend| backend.rollback_savepoint(id, nest_level))?;
                bridge.clear_error_condition();
            }
        }
        bridge.savepoints.forget_from(bridge, nest_level);
        self.forget(bridge);
        Ok(())
    }

    /// Drops the nesting association: afterwards release and rollback are
    /// no-ops.
    fn forget(&self, bridge: &Bridge) {
        self.0.nest_level.set(0);
        if let Some(level) = self.0.invocation_level.take() {
            if let Some(invocation) = Invocation::lookup(bridge, level) {
                invocation.forget_savepoint(self);
            }
        }
    }

    /// Resolves a savepoint still open when the invocation that set it exits.
    pub(crate) fn on_invocation_exit(&self, bridge: &Bridge, with_error: bool) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        if !with_error && bridge.config.get().release_lingering_savepoints {
            tracing::warn!(savepoint = %self, "savepoint was not released by the invocation that set it; releasing it");
            self.resolve(bridge, Resolution::Release)
        } else {
            tracing::warn!(savepoint = %self, with_error, "savepoint was not released by the invocation that set it; rolling it back");
            self.resolve(bridge, Resolution::Rollback)
        }
    }
}

impl fmt::Display for Savepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "\"{name}\" ({})", self.id()),
            None => write!(f, "{}", self.id()),
        }
    }
}

impl fmt::Debug for Savepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Savepoint")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("nest_level", &self.nest_level())
            .finish()
    }
}

#[derive(Default)]
pub(crate) struct SavepointRegistry {
    nursery: RefCell<Option<Savepoint>>,
    known: RefCell<BTreeMap<SubXactId, Savepoint>>,
}

impl SavepointRegistry {
    pub(crate) fn lookup(&self, id: SubXactId) -> Option<Savepoint> {
        if !id.is_valid() {
            return None;
        }
        if let Some(savepoint) = self.known.borrow().get(&id) {
            return Some(savepoint.clone());
        }
        let nursery = self.nursery.borrow();
        let savepoint = nursery.as_ref()?;
        if !savepoint.id().is_valid() {
            savepoint.0.id.set(id);
        }
        if savepoint.id() == id {
            Some(savepoint.clone())
        } else {
            None
        }
    }

    /// Like `lookup`, but never hands `id` to a savepoint still being
    /// established.
    pub(crate) fn lookup_known(&self, id: SubXactId) -> Option<Savepoint> {
        self.known.borrow().get(&id).cloned()
    }

    /// Forgets every known savepoint at `nest_level` or deeper; the engine has
    /// just resolved them.
    pub(crate) fn forget_from(&self, bridge: &Bridge, nest_level: u32) {
        let gone: Vec<Savepoint> = {
            let mut known = self.known.borrow_mut();
            let ids: Vec<SubXactId> = known
                .iter()
                .filter(|(_, sp)| sp.nest_level() >= nest_level)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| known.remove(id)).collect()
        };
        for savepoint in gone {
            savepoint.forget(bridge);
        }
    }

    pub(crate) fn forget_id(&self, bridge: &Bridge, id: SubXactId) {
        let nest_level = self.known.borrow().get(&id).map(Savepoint::nest_level);
        if let Some(nest_level) = nest_level.filter(|level| *level != 0) {
            self.forget_from(bridge, nest_level);
        }
    }

    /// The top-level transaction ended; no savepoint survives that.
    pub(crate) fn forget_all(&self, bridge: &Bridge) {
        let gone = std::mem::take(&mut *self.known.borrow_mut());
        for savepoint in gone.into_values() {
            savepoint.forget(bridge);
        }
    }
}
