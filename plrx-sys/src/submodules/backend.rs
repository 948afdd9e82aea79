//! What `plrx` needs from the engine.
use crate::{NativeError, NativeHandle, SubXactId, Window};

/// The native routine that frees a structure when the managed side lets go of
/// it before the engine's scope ends.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NativeRelease {
    Pfree,
    MemoryContextDelete,
    FreeTupleDesc,
    HeapFreeTuple,
    FreeErrorData,
    SpiFreeTupTable,
    SpiCursorClose,
}

/// Calls from the bridge into the engine.
///
/// Every method is invoked on the native-capable thread only, and any of them
/// may reenter `plrx::hooks` before returning (the engine is free to fire
/// subtransaction callbacks from inside `set_savepoint`, for instance).
/// Implementations must therefore not hold borrows of their own state across
/// such callbacks.
pub trait Backend {
    /// Copies `out.len()` bytes starting at `offset` of `window` into `out`.
    fn read_window(&self, window: Window, offset: usize, out: &mut [u8]);

    /// Copies `bytes` into `window` starting at `offset`.
    fn write_window(&self, window: Window, offset: usize, bytes: &[u8]);

    /// Opens a checkpoint, returning the identifier the engine assigned.
    fn set_savepoint(&self, name: Option<&str>) -> Result<SubXactId, NativeError>;

    fn release_savepoint(&self, id: SubXactId, nest_level: u32) -> Result<(), NativeError>;

    fn rollback_savepoint(&self, id: SubXactId, nest_level: u32) -> Result<(), NativeError>;

    /// The engine's current transaction nesting depth.
    fn transaction_nest_level(&self) -> u32;

    fn register_xact_callback(&self);
    fn unregister_xact_callback(&self);
    fn register_subxact_callback(&self);
    fn unregister_subxact_callback(&self);

    /// Frees `handle` with the routine `kind` names.
    fn release_native(&self, kind: NativeRelease, handle: NativeHandle) -> Result<(), NativeError>;

    /// The value of an engine configuration setting, if it is defined.
    fn config_option(&self, _name: &str) -> Option<String> {
        None
    }
}
