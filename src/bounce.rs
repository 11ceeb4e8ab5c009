//! sdcard-blockio - Bounce buffer
//!
//! Transfers whose caller buffer does not meet the transport's alignment
//! go through a freshly allocated aligned buffer instead. The allocation
//! is released when the buffer goes out of scope, on success and failure
//! paths alike.

use alloc::alloc::{alloc, dealloc, Layout};
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::slice;

use crate::Error;

/// An owned, aligned transfer buffer.
pub(crate) struct BounceBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl BounceBuffer {
    /// Allocate `len` bytes at `align`. `len` must be non-zero and `align`
    /// a power of two.
    pub(crate) fn new(len: usize, align: usize) -> Result<BounceBuffer, Error> {
        debug_assert!(len > 0);
        let layout = Layout::from_size_align(len, align).map_err(|_| Error::Parameter)?;
        let ptr = unsafe { alloc(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Ok(BounceBuffer { ptr, layout }),
            None => Err(Error::OutOfResources),
        }
    }
}

impl Deref for BounceBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for BounceBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for BounceBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
