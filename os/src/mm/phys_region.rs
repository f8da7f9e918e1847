//! Backing memory for the frame allocator.
//!
//! On the board the managed range runs from the end of the kernel image to
//! `MEMORY_END`. Hosted builds carve a page-aligned block out of the heap
//! instead, so the same identity-mapped frame accesses work unchanged.

use super::{PhysAddr, PhysPageNum};
use crate::config::PAGE_SIZE;
use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};

/// A page-aligned, owned span of frames
pub struct PhysRegion {
    base: *mut u8,
    layout: Layout,
}

// SAFETY: the region is plain memory; all access goes through frame owners.
unsafe impl Send for PhysRegion {}
unsafe impl Sync for PhysRegion {}

impl PhysRegion {
    /// Reserve `frames` page frames.
    pub fn new(frames: usize) -> Self {
        assert!(frames > 0, "empty physical region");
        let layout = match Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => panic!("physical region of {} frames is too large", frames),
        };
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            handle_alloc_error(layout);
        }
        Self { base, layout }
    }
    pub fn start(&self) -> PhysPageNum {
        PhysAddr::from(self.base as usize).floor()
    }
    pub fn end(&self) -> PhysPageNum {
        PhysAddr::from(self.base as usize + self.layout.size()).floor()
    }
}

impl Drop for PhysRegion {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}
