//! State of the bridge on the native-capable thread.
//!
//! All of it lives in one thread-local [`Bridge`]. The thread that called
//! [`crate::init`] is by definition the native-capable thread: on any other
//! thread there is no `Bridge`, and every entry point reports
//! [`UsageError::NotNativeThread`]. Nothing here is locked; the handles built on
//! top of it are `!Send`, so the compiler keeps them on this thread.
use crate::dual_state::Statistics;
use crate::error::{BridgeError, Result, UsageError};
use crate::gate::Gate;
use crate::guc::Config;
use crate::invocation::InvocationTable;
use crate::lifespan::{Lifespan, NativeScope};
use crate::savepoint::SavepointRegistry;
use crate::sys::{Backend, CallFrameWindow, NativeError, NativeHandle, Window};
use crate::listener::Registry;
use crate::xact::{SubXact, Xact};
use bytemuck::Pod;
use once_cell::unsync::OnceCell;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

thread_local! {
    static BRIDGE: OnceCell<Rc<Bridge>> = OnceCell::new();
}

pub(crate) struct Bridge {
    pub(crate) backend: Rc<dyn Backend>,
    pub(crate) config: Cell<Config>,
    pub(crate) invocations: RefCell<InvocationTable>,
    pub(crate) lifespans: RefCell<HashMap<NativeScope, Lifespan>>,
    /// The one unresolved engine error, if any. There is a single slot for the
    /// whole thread rather than one per nesting level; a nested invocation that
    /// catches and ignores an error leaves it here for its callers to trip
    /// over.
    pub(crate) pending_error: RefCell<Option<NativeError>>,
    pub(crate) savepoints: SavepointRegistry,
    pub(crate) xact: Registry<Xact>,
    pub(crate) subxact: Registry<SubXact>,
    pub(crate) stats: Cell<Statistics>,
    pub(crate) next_state_id: Cell<u64>,
    pub(crate) gate: Arc<Gate>,
}

pub(crate) fn install(backend: Rc<dyn Backend>, config: Config) -> Result<()> {
    let bridge = Rc::new(Bridge {
        backend,
        config: Cell::new(config),
        invocations: RefCell::default(),
        lifespans: RefCell::default(),
        pending_error: RefCell::new(None),
        savepoints: SavepointRegistry::default(),
        xact: Registry::default(),
        subxact: Registry::default(),
        stats: Cell::default(),
        next_state_id: Cell::new(1),
        gate: Arc::new(Gate::new(std::thread::current().id())),
    });
    BRIDGE
        .try_with(|cell| cell.set(bridge).map_err(|_| UsageError::AlreadyInitialized))
        .map_err(|_| UsageError::NotNativeThread)??;
    tracing::debug!(?config, "plrx bridge initialized");
    Ok(())
}

/// The bridge, or a usage error when called off the native-capable thread.
pub(crate) fn bridge() -> Result<Rc<Bridge>> {
    BRIDGE
        .try_with(|cell| cell.get().cloned())
        .ok()
        .flatten()
        .ok_or(BridgeError::Usage(UsageError::NotNativeThread))
}

impl Bridge {
    /// Calls into the engine, unless an earlier engine error is still
    /// unresolved. A failure is recorded as the new pending error.
    pub(crate) fn call_native<R>(
        &self,
        f: impl FnOnce(&dyn Backend) -> Result<R, NativeError>,
    ) -> Result<R> {
        if let Some(cause) = self.pending_error.borrow().clone() {
            return Err(BridgeError::Unhandled { cause });
        }
        self.call_native_resolving(f)
    }

    /// Like [`call_native`](Self::call_native), but allowed while an error is
    /// pending. Used by the calls that resolve such an error, and by release
    /// paths, which must never be refused.
    pub(crate) fn call_native_resolving<R>(
        &self,
        f: impl FnOnce(&dyn Backend) -> Result<R, NativeError>,
    ) -> Result<R> {
        let backend = Rc::clone(&self.backend);
        f(&*backend).map_err(|err| {
            self.record_error(err.clone());
            BridgeError::Native(err)
        })
    }

    fn record_error(&self, err: NativeError) {
        *self.pending_error.borrow_mut() = Some(err);
        self.write_window(CallFrameWindow::error_occurred_offset(), 1u32);
    }

    pub(crate) fn clear_error_condition(&self) {
        self.pending_error.borrow_mut().take();
        self.write_window(CallFrameWindow::error_occurred_offset(), 0u32);
    }

    pub(crate) fn read_window<T: Pod>(&self, offset: usize) -> T {
        let mut value = T::zeroed();
        self.backend.read_window(Window::CallFrame, offset, bytemuck::bytes_of_mut(&mut value));
        value
    }

    pub(crate) fn write_window<T: Pod>(&self, offset: usize, value: T) {
        self.backend.write_window(Window::CallFrame, offset, bytemuck::bytes_of(&value));
    }

    pub(crate) fn nesting_level(&self) -> u32 {
        self.read_window(CallFrameWindow::nesting_level_offset())
    }

    pub(crate) fn error_flag(&self) -> bool {
        self.read_window::<u32>(CallFrameWindow::error_occurred_offset()) != 0
    }

    pub(crate) fn upper_context(&self) -> NativeHandle {
        let addr: u64 = self.read_window(CallFrameWindow::upper_context_offset());
        NativeHandle::from_addr(addr as usize)
    }

    pub(crate) fn next_state_id(&self) -> u64 {
        let id = self.next_state_id.get();
        self.next_state_id.set(id + 1);
        id
    }

    pub(crate) fn count(&self, f: impl FnOnce(&mut Statistics)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }
}
