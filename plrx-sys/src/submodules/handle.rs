//! Opaque identifiers handed out by the engine.
use core::fmt;
use sptr::Strict;

/// A pointer-sized reference to a structure owned by the engine.
///
/// The bridge never dereferences one of these. A handle means something only
/// together with the [`Lifespan`] governing it, and only on the native-capable
/// thread.
///
/// [`Lifespan`]: https://docs.rs/plrx/latest/plrx/lifespan/struct.Lifespan.html
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct NativeHandle(usize);

impl NativeHandle {
    pub const NULL: NativeHandle = NativeHandle(0);

    #[inline]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    /// Exposes the provenance of `ptr`, as the engine does for everything it
    /// hands out.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(Strict::expose_addr(ptr))
    }

    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeHandle({:#x})", self.0)
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The engine's identifier for an established checkpoint (a subtransaction).
///
/// `0` is never assigned and means "not established yet".
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SubXactId(pub u32);

impl SubXactId {
    pub const INVALID: SubXactId = SubXactId(0);

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for SubXactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_carries_the_pointer_address() {
        let value = 17u64;
        let ptr = &value as *const u64;
        let handle = NativeHandle::from_ptr(ptr);
        assert!(!handle.is_null());
        assert_eq!(handle.addr(), ptr as usize);
        assert_eq!(handle, NativeHandle::from_addr(ptr as usize));
        assert!(NativeHandle::NULL.is_null());
    }

    #[test]
    fn zero_subxact_id_is_invalid() {
        assert!(!SubXactId::INVALID.is_valid());
        assert!(SubXactId(3).is_valid());
        assert_eq!(SubXactId::default(), SubXactId::INVALID);
    }
}
