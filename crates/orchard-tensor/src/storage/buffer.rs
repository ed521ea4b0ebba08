//! Aligned host buffers.
//!
//! Host storage is allocated zeroed at [`ALIGNMENT`] bytes so it can be handed
//! to accelerators that require it, and so that wrapped and owned buffers
//! obey the same rule.

use crate::device::ALIGNMENT;
use std::alloc::{self, Layout as AllocLayout};
use std::ptr::NonNull;

/// A zeroed, aligned host allocation.
#[derive(Debug)]
pub(crate) struct HostBuffer {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) layout: AllocLayout,
}

impl HostBuffer {
    /// Allocate `nbytes` zeroed bytes. Returns `None` when the allocator fails
    /// or the size cannot be represented.
    pub(crate) fn zeroed(nbytes: usize) -> Option<Self> {
        let layout = AllocLayout::from_size_align(nbytes.max(1), ALIGNMENT).ok()?;
        // SAFETY: `layout` has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(raw).map(|ptr| Self { ptr, layout })
    }

    /// Return the memory to the allocator.
    ///
    /// # Safety
    /// `ptr` and `layout` must come from the same [`HostBuffer::zeroed`] call
    /// and must not be used afterwards.
    pub(crate) unsafe fn release(ptr: NonNull<u8>, layout: AllocLayout) {
        // SAFETY: guaranteed by the caller.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// Whether `ptr` satisfies `alignment`.
#[inline]
pub(crate) fn is_aligned(ptr: *const u8, alignment: usize) -> bool {
    (ptr as usize) % alignment == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_is_aligned_and_zero() {
        let buffer = HostBuffer::zeroed(100).unwrap();
        assert!(is_aligned(buffer.ptr.as_ptr(), ALIGNMENT));
        // SAFETY: 100 bytes were just allocated.
        let bytes = unsafe { std::slice::from_raw_parts(buffer.ptr.as_ptr(), 100) };
        assert!(bytes.iter().all(|&b| b == 0));
        // SAFETY: pair from `zeroed` above, not used afterwards.
        unsafe { HostBuffer::release(buffer.ptr, buffer.layout) };
    }

    #[test]
    fn test_zero_size_allocates() {
        let buffer = HostBuffer::zeroed(0).unwrap();
        assert_eq!(buffer.layout.size(), 1);
        // SAFETY: pair from `zeroed` above.
        unsafe { HostBuffer::release(buffer.ptr, buffer.layout) };
    }

    #[test]
    fn test_unrepresentable_size() {
        assert!(HostBuffer::zeroed(usize::MAX).is_none());
    }
}
