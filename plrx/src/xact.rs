//! Transaction and subtransaction events.
//!
//! Listeners are registered per thread and are delivered events only while
//! at least one is registered: the first registration asks the engine to
//! start calling [`hooks::xact_event`](crate::hooks::xact_event) (or
//! [`hooks::subxact_event`](crate::hooks::subxact_event)), and removing the
//! last one asks it to stop.
//!
//! ```ignore
//! let listener = Rc::new(XactListener::new().on(XactEvent::Commit, |info| {
//!     tracing::info!(event = ?info.event, "committed");
//!     Ok(())
//! }));
//! plrx::xact::add_xact_listener(&listener)?;
//! ```
use crate::context::{self, Bridge};
use crate::error::Result;
use crate::listener::{EventClass, Listener};
use crate::savepoint::Savepoint;
use crate::sys::{Backend, SubXactId};
use enum_map::Enum;
use std::rc::Rc;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Enum)]
pub enum XactEvent {
    Commit,
    Abort,
    Prepare,
    PreCommit,
    PrePrepare,
    ParallelCommit,
    ParallelAbort,
    ParallelPreCommit,
}

impl XactEvent {
    /// The top-level transaction is over; no savepoint outlives it.
    fn ends_transaction(self) -> bool {
        matches!(self, XactEvent::Commit | XactEvent::Abort | XactEvent::Prepare)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Enum)]
pub enum SubXactEvent {
    Start,
    Commit,
    Abort,
    PreCommit,
}

#[derive(Clone, Debug)]
pub struct XactInfo {
    pub event: XactEvent,
}

#[derive(Clone, Debug)]
pub struct SubXactInfo {
    pub event: SubXactEvent,
    pub id: SubXactId,
    pub parent: SubXactId,
    /// The savepoint set through the bridge with identifier `id`, if any.
    pub savepoint: Option<Savepoint>,
    /// The savepoint set through the bridge with identifier `parent`, if any.
    pub parent_savepoint: Option<Savepoint>,
}

pub struct Xact;

impl EventClass for Xact {
    type Event = XactEvent;
    type Payload = XactInfo;

    const NAME: &'static str = "transaction";

    fn begin_delivery(backend: &dyn Backend) {
        backend.register_xact_callback();
    }

    fn stop_delivery(backend: &dyn Backend) {
        backend.unregister_xact_callback();
    }

    fn is_terminal(event: XactEvent) -> bool {
        matches!(
            event,
            XactEvent::Commit
                | XactEvent::Abort
                | XactEvent::Prepare
                | XactEvent::ParallelCommit
                | XactEvent::ParallelAbort
        )
    }
}

pub struct SubXact;

impl EventClass for SubXact {
    type Event = SubXactEvent;
    type Payload = SubXactInfo;

    const NAME: &'static str = "subtransaction";

    fn begin_delivery(backend: &dyn Backend) {
        backend.register_subxact_callback();
    }

    fn stop_delivery(backend: &dyn Backend) {
        backend.unregister_subxact_callback();
    }

    fn is_terminal(event: SubXactEvent) -> bool {
        matches!(event, SubXactEvent::Commit | SubXactEvent::Abort)
    }
}

pub type XactListener = Listener<Xact>;
pub type SubXactListener = Listener<SubXact>;

/// Registers `listener`; returns `false` if it already was.
pub fn add_xact_listener(listener: &Rc<XactListener>) -> Result<bool> {
    let bridge = context::bridge()?;
    Ok(bridge.xact.add(listener, &*bridge.backend))
}

/// Unregisters `listener`; returns `false` if it was not registered.
pub fn remove_xact_listener(listener: &Rc<XactListener>) -> Result<bool> {
    let bridge = context::bridge()?;
    Ok(bridge.xact.remove(listener, &*bridge.backend))
}

pub fn add_subxact_listener(listener: &Rc<SubXactListener>) -> Result<bool> {
    let bridge = context::bridge()?;
    Ok(bridge.subxact.add(listener, &*bridge.backend))
}

pub fn remove_subxact_listener(listener: &Rc<SubXactListener>) -> Result<bool> {
    let bridge = context::bridge()?;
    Ok(bridge.subxact.remove(listener, &*bridge.backend))
}

/// Number of registered transaction and subtransaction listeners.
pub fn listener_counts() -> Result<(usize, usize)> {
    let bridge = context::bridge()?;
    Ok((bridge.xact.len(), bridge.subxact.len()))
}

pub(crate) fn dispatch_xact(bridge: &Bridge, event: XactEvent) -> Result<()> {
    let delivered = bridge.xact.dispatch(event, &XactInfo { event });
    if event.ends_transaction() {
        bridge.savepoints.forget_all(bridge);
    }
    delivered
}

pub(crate) fn dispatch_subxact(
    bridge: &Bridge,
    event: SubXactEvent,
    id: SubXactId,
    parent: SubXactId,
) -> Result<()> {
    let savepoint = bridge.savepoints.lookup(id);
    let parent_savepoint = bridge.savepoints.lookup_known(parent);
    let info = SubXactInfo { event, id, parent, savepoint, parent_savepoint };
    let delivered = bridge.subxact.dispatch(event, &info);
    if matches!(event, SubXactEvent::Commit | SubXactEvent::Abort) {
        bridge.savepoints.forget_id(bridge, id);
    }
    delivered
}
