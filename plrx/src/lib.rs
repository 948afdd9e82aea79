//! `plrx` keeps Rust code hosted inside a database engine honest about the
//! lifetime of the engine's structures.
//!
//! The engine frees its structures in bulk when a transaction, subtransaction
//! or call ends. Rust code that has been handed a pointer to one of them holds
//! it in a [`DualState`](dual_state::DualState), registered against the
//! [`Lifespan`](lifespan::Lifespan) standing in for that scope; once the
//! scope has ended, the handle can no longer be read.
//!
//! Around that core the crate keeps the stack of [invocations](invocation)
//! (with the [savepoints](savepoint) set during each), delivers
//! [transaction events](xact) to registered listeners and maintains
//! [pools](pool) of reusable helper objects.
//!
//! Exactly one thread may call into the engine. It is the one that calls
//! [`init`]; all of the bridge's state lives there, and other threads reach it
//! through the [`Gate`](gate::Gate).
use std::rc::Rc;
use std::sync::Arc;

pub use plrx_sys as sys;

mod context;
pub mod dual_state;
pub mod error;
pub mod gate;
pub mod guc;
pub mod hooks;
pub mod invocation;
pub mod lifespan;
pub mod listener;
pub mod pool;
pub mod savepoint;
pub mod security;
mod util;
pub mod xact;

pub mod prelude;

pub use error::{BridgeError, Result, UsageError};

/// Installs the bridge on the calling thread, which becomes the
/// native-capable thread. Settings are read from the engine.
pub fn init(backend: Rc<dyn sys::Backend>) -> Result<()> {
    let config = guc::Config::from_backend(&*backend)?;
    context::install(backend, config)
}

pub fn init_with_config(backend: Rc<dyn sys::Backend>, config: guc::Config) -> Result<()> {
    context::install(backend, config)
}

/// The gate onto this thread, for handing to other threads.
pub fn gate() -> Result<Arc<gate::Gate>> {
    Ok(Arc::clone(&context::bridge()?.gate))
}

pub fn statistics() -> Result<dual_state::Statistics> {
    Ok(context::bridge()?.stats.get())
}
