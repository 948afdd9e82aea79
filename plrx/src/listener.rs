//! Ordered listener registries with per-event closure tables.
use crate::error::{BoxError, BridgeError, Result};
use crate::security::{self, SecurityContext};
use crate::sys::Backend;
use enum_map::{EnumArray, EnumMap};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A callback for one kind of event.
pub type Handler<P> = Box<dyn Fn(&P) -> Result<(), BoxError>>;

/// A family of engine events delivered to one registry.
pub trait EventClass: Sized + 'static {
    type Event: EnumArray<Option<Handler<Self::Payload>>> + Copy + fmt::Debug;
    type Payload;

    const NAME: &'static str;

    fn begin_delivery(backend: &dyn Backend);
    fn stop_delivery(backend: &dyn Backend);

    /// Whether the event reports something that already happened, so a
    /// failing listener cannot change the outcome and the others still run.
    fn is_terminal(event: Self::Event) -> bool;
}

/// A table of callbacks, at most one per event kind.
///
/// Registries compare listeners by identity, so share one through an `Rc`.
pub struct Listener<C: EventClass> {
    handlers: EnumMap<C::Event, Option<Handler<C::Payload>>>,
}

impl<C: EventClass> Listener<C> {
    pub fn new() -> Self {
        Self { handlers: EnumMap::default() }
    }

    pub fn on(
        mut self,
        event: C::Event,
        handler: impl Fn(&C::Payload) -> Result<(), BoxError> + 'static,
    ) -> Self {
        self.handlers[event] = Some(Box::new(handler));
        self
    }

    pub fn handles(&self, event: C::Event) -> bool {
        self.handlers[event].is_some()
    }
}

impl<C: EventClass> Default for Listener<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: EventClass> fmt::Debug for Listener<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let events: Vec<_> = self.handlers.iter().filter(|(_, h)| h.is_some()).map(|(e, _)| e).collect();
        f.debug_struct("Listener").field("class", &C::NAME).field("events", &events).finish()
    }
}

struct Registration<C: EventClass> {
    listener: Rc<Listener<C>>,
    context: SecurityContext,
}

impl<C: EventClass> Clone for Registration<C> {
    fn clone(&self) -> Self {
        Self { listener: Rc::clone(&self.listener), context: self.context.clone() }
    }
}

/// Registrations, most recently added first.
pub(crate) struct Registry<C: EventClass> {
    entries: RefCell<Vec<Registration<C>>>,
}

impl<C: EventClass> Default for Registry<C> {
    fn default() -> Self {
        Self { entries: RefCell::default() }
    }
}

impl<C: EventClass> Registry<C> {
    /// Adds `listener` unless already present; the first registration turns
    /// on delivery of this class of events. Returns whether it was added.
    pub(crate) fn add(&self, listener: &Rc<Listener<C>>, backend: &dyn Backend) -> bool {
        let first = {
            let mut entries = self.entries.borrow_mut();
            if entries.iter().any(|r| Rc::ptr_eq(&r.listener, listener)) {
                return false;
            }
            entries.insert(0, Registration {
                listener: Rc::clone(listener),
                context: SecurityContext::current(),
            });
            entries.len() == 1
        };
        if first {
            C::begin_delivery(backend);
        }
        true
    }

    /// Removes `listener` if present; removing the last one turns delivery
    /// off. Returns whether it was present.
    pub(crate) fn remove(&self, listener: &Rc<Listener<C>>, backend: &dyn Backend) -> bool {
        let emptied = {
            let mut entries = self.entries.borrow_mut();
            let Some(at) = entries.iter().position(|r| Rc::ptr_eq(&r.listener, listener)) else {
                return false;
            };
            entries.remove(at);
            entries.is_empty()
        };
        if emptied {
            C::stop_delivery(backend);
        }
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Delivers `event` to a snapshot of the registrations, so listeners may
    /// add or remove listeners (themselves included) while it runs.
    pub(crate) fn dispatch(&self, event: C::Event, payload: &C::Payload) -> Result<()> {
        let snapshot: Vec<Registration<C>> = self.entries.borrow().clone();
        let terminal = C::is_terminal(event);
        let mut first_failure = None;

        for registration in &snapshot {
            let Some(handler) = &registration.listener.handlers[event] else {
                continue;
            };
            let Err(source) = security::with_context(&registration.context, || handler(payload)) else {
                continue;
            };
            let err = BridgeError::Listener { event: format!("{} {:?}", C::NAME, event), source };
            if !terminal {
                return Err(err);
            }
            if first_failure.is_none() {
                first_failure = Some(err);
            } else {
                tracing::warn!(error = %err, "additional listener failure");
            }
        }
        first_failure.map_or(Ok(()), Err)
    }
}
