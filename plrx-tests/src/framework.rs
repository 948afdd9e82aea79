use parking_lot::Mutex;
use plrx::hooks;
use plrx::invocation::Invocation;
use plrx::lifespan::NativeScope;
use plrx::sys::{
    Backend, CallFrameWindow, NativeError, NativeHandle, NativeRelease, SqlState, SubXactId, Window,
};
use plrx::xact::{SubXactEvent, XactEvent};
use once_cell::unsync::OnceCell;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// How many times the bridge called each [`Backend`] method.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Calls {
    pub set_savepoint: u32,
    pub release_savepoint: u32,
    pub rollback_savepoint: u32,
    pub register_xact: u32,
    pub unregister_xact: u32,
    pub register_subxact: u32,
    pub unregister_subxact: u32,
    pub release_native: u32,
}

/// Engine calls that can be made to fail.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Fault {
    SetSavepoint,
    ReleaseSavepoint,
    RollbackSavepoint,
    ReleaseNative,
}

impl Fault {
    fn error(self) -> NativeError {
        let message = match self {
            Fault::SetSavepoint => "could not define savepoint",
            Fault::ReleaseSavepoint => "could not release savepoint",
            Fault::RollbackSavepoint => "could not roll back to savepoint",
            Fault::ReleaseNative => "could not free native structure",
        };
        NativeError::new(SqlState::INTERNAL_ERROR, message).with_detail("injected by the test engine")
    }
}

#[derive(Default)]
struct EngineState {
    window: Cell<CallFrameWindow>,
    depth: Cell<u32>,
    next_subxact: Cell<u32>,
    /// Open subtransactions, outermost first, with their nest levels.
    open: RefCell<Vec<(SubXactId, u32)>>,
    xact_delivery: Cell<bool>,
    subxact_delivery: Cell<bool>,
    calls: Cell<Calls>,
    faults: RefCell<HashSet<Fault>>,
    settings: RefCell<HashMap<String, String>>,
    freed: RefCell<Vec<(NativeRelease, NativeHandle)>>,
}

thread_local! {
    static INSTALLED: OnceCell<MockEngine> = OnceCell::new();
}

/// A scripted, in-memory engine.
///
/// Cloning yields another handle to the same engine.
#[derive(Clone, Default)]
pub struct MockEngine(Rc<EngineState>);

impl MockEngine {
    /// The engine installed as the bridge's backend on this thread,
    /// installing one first if there is none.
    pub fn install() -> MockEngine {
        INSTALLED.with(|installed| installed.get_or_init(|| Self::create(&[])).clone())
    }

    /// Installs a new engine with `settings` defined.
    ///
    /// # Panics
    ///
    /// If an engine is already installed on this thread.
    pub fn install_with(settings: &[(&str, &str)]) -> MockEngine {
        INSTALLED.with(|installed| {
            let engine = Self::create(settings);
            assert!(installed.set(engine.clone()).is_ok(), "engine already installed on this thread");
            engine
        })
    }

    fn create(settings: &[(&str, &str)]) -> MockEngine {
        let engine = MockEngine::default();
        engine.0.next_subxact.set(1);
        for (name, value) in settings {
            engine.0.settings.borrow_mut().insert((*name).to_owned(), (*value).to_owned());
        }
        plrx::init(Rc::new(engine.clone())).expect("bridge already installed on this thread");
        engine
    }

    /// Calls into managed code one level deeper than the current one.
    pub fn enter(&self) -> plrx::Result<Invocation> {
        let level = self.0.depth.get();
        self.0.depth.set(level + 1);
        self.update_window(|w| w.nesting_level = level);
        hooks::invocation_entered()
    }

    /// Returns from the innermost managed call.
    pub fn exit(&self, with_error: bool) -> plrx::Result<()> {
        let depth = self.0.depth.get();
        assert!(depth > 0, "exit without a matching enter");
        self.unwind_to(depth - 1, with_error)
    }

    /// Unwinds every managed call at `level` and deeper in one step, the way
    /// an engine error escaping several nested calls does.
    pub fn unwind_to(&self, level: u32, with_error: bool) -> plrx::Result<()> {
        let exited = hooks::invocation_exited(level, with_error);
        self.0.depth.set(level);
        self.update_window(|w| w.nesting_level = level.saturating_sub(1));
        exited
    }

    /// Commits the top-level transaction, firing the events a real engine
    /// would.
    pub fn commit(&self) -> plrx::Result<()> {
        self.xact_event(XactEvent::PreCommit)?;
        let open = std::mem::take(&mut *self.0.open.borrow_mut());
        for (id, _) in open.iter().rev() {
            self.subxact_event(SubXactEvent::Commit, *id)?;
        }
        self.xact_event(XactEvent::Commit)
    }

    /// Aborts the top-level transaction; open subtransactions abort first.
    pub fn abort(&self) -> plrx::Result<()> {
        let open = std::mem::take(&mut *self.0.open.borrow_mut());
        for (id, _) in open.iter().rev() {
            self.subxact_event(SubXactEvent::Abort, *id)?;
        }
        self.xact_event(XactEvent::Abort)
    }

    pub fn end_scope(&self, scope: NativeScope) -> plrx::Result<bool> {
        hooks::lifespan_ended(scope)
    }

    pub fn inject(&self, fault: Fault) {
        self.0.faults.borrow_mut().insert(fault);
    }

    pub fn heal(&self, fault: Fault) {
        self.0.faults.borrow_mut().remove(&fault);
    }

    pub fn calls(&self) -> Calls {
        self.0.calls.get()
    }

    pub fn window(&self) -> CallFrameWindow {
        self.0.window.get()
    }

    pub fn set_upper_context(&self, context: NativeHandle) {
        self.update_window(|w| w.upper_context = context.addr() as u64);
    }

    /// Structures freed through [`Backend::release_native`], in order.
    pub fn freed(&self) -> Vec<(NativeRelease, NativeHandle)> {
        self.0.freed.borrow().clone()
    }

    pub fn open_subxacts(&self) -> usize {
        self.0.open.borrow().len()
    }

    pub fn delivering(&self) -> (bool, bool) {
        (self.0.xact_delivery.get(), self.0.subxact_delivery.get())
    }

    fn update_window(&self, f: impl FnOnce(&mut CallFrameWindow)) {
        let mut window = self.0.window.get();
        f(&mut window);
        self.0.window.set(window);
    }

    fn count(&self, f: impl FnOnce(&mut Calls)) {
        let mut calls = self.0.calls.get();
        f(&mut calls);
        self.0.calls.set(calls);
    }

    fn check(&self, fault: Fault) -> Result<(), NativeError> {
        if self.0.faults.borrow().contains(&fault) {
            return Err(fault.error());
        }
        Ok(())
    }

    fn xact_event(&self, event: XactEvent) -> plrx::Result<()> {
        if !self.0.xact_delivery.get() {
            return Ok(());
        }
        hooks::xact_event(event)
    }

    fn subxact_event(&self, event: SubXactEvent, id: SubXactId) -> plrx::Result<()> {
        if !self.0.subxact_delivery.get() {
            return Ok(());
        }
        let parent = {
            let open = self.0.open.borrow();
            open.iter().rev().map(|(open_id, _)| *open_id).find(|open_id| *open_id < id)
        };
        hooks::subxact_event(event, id, parent.unwrap_or(SubXactId::INVALID))
    }

    /// Closes every subtransaction at `nest_level` or deeper, innermost first.
    fn close_from(&self, nest_level: u32, event: SubXactEvent) -> Result<(), NativeError> {
        loop {
            let innermost = self.0.open.borrow().last().copied();
            let Some((id, _)) = innermost.filter(|(_, level)| *level >= nest_level) else {
                return Ok(());
            };
            // delivered while still open, as the engine does
            if let Err(err) = self.subxact_event(event, id) {
                tracing::warn!(error = %err, "subtransaction callback failed");
            }
            self.0.open.borrow_mut().retain(|(open_id, _)| *open_id != id);
        }
    }
}

impl Backend for MockEngine {
    fn read_window(&self, window: Window, offset: usize, out: &mut [u8]) {
        let Window::CallFrame = window;
        let frame = self.0.window.get();
        out.copy_from_slice(&frame.as_bytes()[offset..offset + out.len()]);
    }

    fn write_window(&self, window: Window, offset: usize, bytes: &[u8]) {
        let Window::CallFrame = window;
        self.update_window(|frame| {
            frame.as_bytes_mut()[offset..offset + bytes.len()].copy_from_slice(bytes)
        });
    }

    fn set_savepoint(&self, _name: Option<&str>) -> Result<SubXactId, NativeError> {
        self.count(|c| c.set_savepoint += 1);
        self.check(Fault::SetSavepoint)?;

        let id = SubXactId(self.0.next_subxact.get());
        self.0.next_subxact.set(id.0 + 1);
        let nest_level = self.transaction_nest_level() + 1;
        self.0.open.borrow_mut().push((id, nest_level));

        // the engine learns about the savepoint object before this call returns
        if let Err(err) = hooks::savepoint_opened(id) {
            tracing::warn!(error = %err, "savepoint lookup failed");
        }
        if let Err(err) = self.subxact_event(SubXactEvent::Start, id) {
            tracing::warn!(error = %err, "subtransaction callback failed");
        }
        Ok(id)
    }

    fn release_savepoint(&self, id: SubXactId, nest_level: u32) -> Result<(), NativeError> {
        self.count(|c| c.release_savepoint += 1);
        self.check(Fault::ReleaseSavepoint)?;
        if !self.0.open.borrow().iter().any(|(open_id, _)| *open_id == id) {
            return Err(NativeError::new(SqlState::INVALID_SAVEPOINT_SPECIFICATION, "no such savepoint"));
        }
        self.close_from(nest_level, SubXactEvent::Commit)
    }

    fn rollback_savepoint(&self, id: SubXactId, nest_level: u32) -> Result<(), NativeError> {
        self.count(|c| c.rollback_savepoint += 1);
        self.check(Fault::RollbackSavepoint)?;
        if !self.0.open.borrow().iter().any(|(open_id, _)| *open_id == id) {
            return Err(NativeError::new(SqlState::INVALID_SAVEPOINT_SPECIFICATION, "no such savepoint"));
        }
        self.close_from(nest_level, SubXactEvent::Abort)
    }

    fn transaction_nest_level(&self) -> u32 {
        self.0.open.borrow().last().map_or(1, |(_, level)| *level)
    }

    fn register_xact_callback(&self) {
        self.count(|c| c.register_xact += 1);
        self.0.xact_delivery.set(true);
    }

    fn unregister_xact_callback(&self) {
        self.count(|c| c.unregister_xact += 1);
        self.0.xact_delivery.set(false);
    }

    fn register_subxact_callback(&self) {
        self.count(|c| c.register_subxact += 1);
        self.0.subxact_delivery.set(true);
    }

    fn unregister_subxact_callback(&self) {
        self.count(|c| c.unregister_subxact += 1);
        self.0.subxact_delivery.set(false);
    }

    fn release_native(&self, kind: NativeRelease, handle: NativeHandle) -> Result<(), NativeError> {
        self.count(|c| c.release_native += 1);
        self.check(Fault::ReleaseNative)?;
        self.0.freed.borrow_mut().push((kind, handle));
        Ok(())
    }

    fn config_option(&self, name: &str) -> Option<String> {
        self.0.settings.borrow().get(name).cloned()
    }
}

impl fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockEngine")
            .field("window", &self.0.window.get())
            .field("open", &self.0.open.borrow())
            .field("calls", &self.0.calls.get())
            .finish()
    }
}

/// Runs `f`, returning what it returned and the messages of every warning
/// logged on this thread meanwhile.
pub fn capture_warnings<R>(f: impl FnOnce() -> R) -> (R, Vec<String>) {
    let warnings = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::registry().with(WarningLayer(Arc::clone(&warnings)));
    let result = tracing::subscriber::with_default(subscriber, f);
    let warnings = std::mem::take(&mut *warnings.lock());
    (result, warnings)
}

struct WarningLayer(Arc<Mutex<Vec<String>>>);

impl<S: Subscriber> Layer<S> for WarningLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::WARN {
            return;
        }
        let mut message = MessageVisitor::default();
        event.record(&mut message);
        self.0.lock().push(message.0);
    }
}

#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}
