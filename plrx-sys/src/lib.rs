//! # Engine-facing interface for `plrx`
//!
//! Everything in this crate describes the native side of the bridge: the
//! opaque handles the engine hands out, the shape of the call-frame window it
//! exposes, the error reports it raises, and the [`Backend`] trait through
//! which `plrx` asks the engine to do things.
//!
//! Nothing here keeps state. The bridge proper (lifespans, invocations,
//! savepoints, listeners) lives in `plrx`, which is the crate extension code
//! should depend on.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod submodules;

pub use submodules::backend::{Backend, NativeRelease};
pub use submodules::error::{NativeError, SqlState};
pub use submodules::handle::{NativeHandle, SubXactId};
pub use submodules::window::{CallFrameWindow, Window};
