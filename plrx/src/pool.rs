//! Per-type pools of reusable instances.
//!
//! An instance is either out (owned by whoever acquired it, as a `Box<T>`) or
//! idle in its type's pool, passivated. Acquiring prefers the most recently
//! released idle instance and activates it again; a fresh instance is only
//! constructed when the pool has none.
//!
//! A failing activation or passivation hook means the instance cannot be
//! trusted to be in a clean state, so it is torn down instead of pooled.
use crate::context;
use crate::error::{BoxError, BridgeError, PoolPhase, Result};
use std::any::{type_name, Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// A type whose instances can be pooled.
pub trait PooledObject: Sized + 'static {
    /// Constructs a new, active instance on behalf of `pool`.
    fn new(pool: &Rc<ObjectPool<Self>>) -> Result<Self, BoxError>;

    /// Called when an idle instance is handed out again.
    fn activate(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called when the instance is returned to the pool.
    fn passivate(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Teardown, called once when the instance leaves the pool for good.
    fn remove(&mut self) {}
}

pub struct ObjectPool<T: PooledObject> {
    idle: RefCell<Vec<Box<T>>>,
    outstanding: Cell<usize>,
}

thread_local! {
    static POOLS: RefCell<HashMap<TypeId, Rc<dyn Any>>> = RefCell::default();
}

impl<T: PooledObject> ObjectPool<T> {
    fn empty() -> Self {
        Self { idle: RefCell::default(), outstanding: Cell::new(0) }
    }

    /// The pool for `T`, created on first request and kept for the life of
    /// the thread. Native thread only.
    pub fn for_type() -> Result<Rc<Self>> {
        context::bridge()?;
        Ok(POOLS.with(|pools| {
            let mut pools = pools.borrow_mut();
            let entry = pools
                .entry(TypeId::of::<T>())
                .or_insert_with(|| Rc::new(Self::empty()) as Rc<dyn Any>);
            // keyed by `TypeId::of::<T>()`, so the entry is always an `ObjectPool<T>`
            Rc::clone(entry).downcast::<Self>().expect("pool registered under another type's id")
        }))
    }

    /// Hands out an idle instance or constructs a new one, activating it
    /// either way.
    pub fn acquire(self: &Rc<Self>) -> Result<Box<T>> {
        let pooled = self.idle.borrow_mut().pop();
        let mut instance = match pooled {
            Some(instance) => instance,
            None => {
                let instance = T::new(self)
                    .map_err(|source| BridgeError::Construct { type_name: type_name::<T>(), source })?;
                Box::new(instance)
            }
        };
        if let Err(source) = instance.activate() {
            instance.remove();
            tracing::debug!(type_name = type_name::<T>(), "activation failed, instance discarded");
            return Err(BridgeError::Teardown {
                type_name: type_name::<T>(),
                phase: PoolPhase::Activation,
                source,
            });
        }
        self.outstanding.set(self.outstanding.get() + 1);
        Ok(instance)
    }

    /// Passivates `instance` and makes it available to the next
    /// [`acquire`](Self::acquire).
    pub fn release(&self, mut instance: Box<T>) -> Result<()> {
        self.checked_in();
        if let Err(source) = instance.passivate() {
            instance.remove();
            return Err(BridgeError::Teardown {
                type_name: type_name::<T>(),
                phase: PoolPhase::Passivation,
                source,
            });
        }
        self.idle.borrow_mut().push(instance);
        Ok(())
    }

    /// Tears `instance` down instead of pooling it.
    pub fn remove(&self, mut instance: Box<T>) {
        self.checked_in();
        instance.remove();
    }

    /// Tears down every idle instance.
    pub fn clear(&self) {
        let idle = std::mem::take(&mut *self.idle.borrow_mut());
        for mut instance in idle {
            instance.remove();
        }
    }

    pub fn idle(&self) -> usize {
        self.idle.borrow().len()
    }

    /// Instances acquired and not yet released or removed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.get()
    }

    fn checked_in(&self) {
        self.outstanding.set(self.outstanding.get().saturating_sub(1));
    }
}

impl<T: PooledObject> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("type", &type_name::<T>())
            .field("idle", &self.idle())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
