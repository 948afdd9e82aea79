//! Entry points the engine calls.
//!
//! The host glue forwards the engine's notifications here, on the
//! native-capable thread. Each of them may in turn call back into the engine
//! through the [`Backend`](crate::sys::Backend).
use crate::context;
use crate::error::Result;
use crate::invocation::{self, Invocation};
use crate::lifespan::NativeScope;
use crate::savepoint::Savepoint;
use crate::sys::SubXactId;
use crate::xact::{self, SubXactEvent, XactEvent};

/// The engine is about to run managed code at the nesting level currently in
/// the call-frame window. Runs any work queued at the gate first.
pub fn invocation_entered() -> Result<Invocation> {
    let bridge = context::bridge()?;
    let serviced = bridge.gate.service()?;
    if serviced > 0 {
        tracing::debug!(serviced, "ran queued hand-offs");
    }
    Invocation::at_level(&bridge, bridge.nesting_level())
}

/// Managed code at `level` has returned to the engine, normally or (with
/// `with_error`) by raising an error.
///
/// Every state scoped to the level is released even when this returns an
/// error; the error is the outcome of resolving a savepoint left open.
pub fn invocation_exited(level: u32, with_error: bool) -> Result<()> {
    let bridge = context::bridge()?;
    let exited = invocation::on_exit(&bridge, level, with_error);
    tracing::debug!(level, with_error, stats = ?bridge.stats.get(), "invocation exited");
    exited
}

/// The engine has ended `scope`. Returns whether the bridge knew of it.
pub fn lifespan_ended(scope: NativeScope) -> Result<bool> {
    let bridge = context::bridge()?;
    let lifespan = bridge.lifespans.borrow().get(&scope).cloned();
    match lifespan {
        Some(lifespan) => {
            lifespan.end(&bridge);
            Ok(true)
        }
        None => Ok(false),
    }
}

pub fn xact_event(event: XactEvent) -> Result<()> {
    let bridge = context::bridge()?;
    xact::dispatch_xact(&bridge, event)
}

pub fn subxact_event(event: SubXactEvent, id: SubXactId, parent: SubXactId) -> Result<()> {
    let bridge = context::bridge()?;
    xact::dispatch_subxact(&bridge, event, id, parent)
}

/// The engine has assigned `id` to a checkpoint that may still be in the
/// middle of being established.
pub fn savepoint_opened(id: SubXactId) -> Result<Option<Savepoint>> {
    Ok(context::bridge()?.savepoints.lookup(id))
}
