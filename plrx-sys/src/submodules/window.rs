//! The call-frame window: a small block of engine memory the bridge reads
//! and writes at fixed byte offsets.
//!
//! The engine keeps the current nesting level, its error-occurred flag and the
//! memory context of the calling executor in one `#[repr(C)]` structure. The
//! bridge never holds a pointer to it; it asks the [`Backend`] to copy bytes
//! in or out at the offsets below, which is all the layout knowledge it needs.
//!
//! [`Backend`]: crate::Backend
use bytemuck::{Pod, Zeroable};
use memoffset::offset_of;

/// Which engine-exposed window a read or write addresses.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Window {
    CallFrame,
}

/// Layout of [`Window::CallFrame`].
///
/// Booleans are stored as `u32` so the structure stays [`Pod`].
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CallFrameWindow {
    pub upper_context: u64,
    pub nesting_level: u32,
    pub error_occurred: u32,
}

impl CallFrameWindow {
    pub fn upper_context_offset() -> usize {
        offset_of!(CallFrameWindow, upper_context)
    }

    pub fn nesting_level_offset() -> usize {
        offset_of!(CallFrameWindow, nesting_level)
    }

    pub fn error_occurred_offset() -> usize {
        offset_of!(CallFrameWindow, error_occurred)
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::bytes_of_mut(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_address_the_fields() {
        let mut window = CallFrameWindow::zeroed();
        window.nesting_level = 7;
        window.error_occurred = 1;
        window.upper_context = 0xdead_beef;

        let bytes = window.as_bytes();
        let at = |off: usize, len: usize| &bytes[off..off + len];
        assert_eq!(bytemuck::pod_read_unaligned::<u32>(at(CallFrameWindow::nesting_level_offset(), 4)), 7);
        assert_eq!(bytemuck::pod_read_unaligned::<u32>(at(CallFrameWindow::error_occurred_offset(), 4)), 1);
        assert_eq!(bytemuck::pod_read_unaligned::<u64>(at(CallFrameWindow::upper_context_offset(), 8)), 0xdead_beef);
    }
}
