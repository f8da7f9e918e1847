//! Per-core physical frame allocator.
//!
//! Every core owns a free list under its own lock. `alloc` pops from the
//! caller's list and, only when that list is empty, steals one frame from
//! the first non-empty list in core order. `dealloc` always pushes onto the
//! caller's list. Both run with migration disabled, so the core id they
//! read stays the list they touch. Locks are held for one push or pop; the
//! allocator never sleeps and reports exhaustion instead of waiting.
use super::{MmError, PhysPageNum, PhysRegion, PPNRange};
use crate::config::{ALLOC_JUNK, FREE_JUNK};
use crate::sync::{Hart, NoMigrate};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt::{self, Debug, Formatter};
use log::{info, trace};
use spin::Mutex;

/// Frame allocator with one free list per core
pub struct FrameAllocator {
    range: PPNRange,
    freelists: Vec<Mutex<Vec<PhysPageNum>>>,
    hart: Arc<dyn Hart>,
    // 页帧所在的内存，分配器存活期间不能被释放
    _region: PhysRegion,
}

impl FrameAllocator {
    /// Manage every frame of `region`, which the allocator then owns.
    pub fn from_region(region: PhysRegion, ncpu: usize, hart: Arc<dyn Hart>) -> Self {
        assert!(ncpu > 0, "frame allocator needs at least one core");
        let (start, end) = (region.start(), region.end());
        let allocator = Self {
            range: PPNRange::new(start, end),
            freelists: (0..ncpu).map(|_| Mutex::new(Vec::new())).collect(),
            hart,
            _region: region,
        };
        // 与普通的释放走同一条路径：所有页帧都进入初始化所在核的空闲链表
        for ppn in allocator.range {
            allocator.dealloc(ppn);
        }
        info!(
            "[kernel] frame allocator: {:?}..{:?}, {} frames, {} cores",
            start,
            end,
            allocator.free_frames(),
            ncpu
        );
        allocator
    }

    fn local(&self, cpu: usize) -> &Mutex<Vec<PhysPageNum>> {
        assert!(
            cpu < self.freelists.len(),
            "cpu {} beyond the {} cores the allocator was built for",
            cpu,
            self.freelists.len()
        );
        &self.freelists[cpu]
    }

    /// Take one frame. Its content is junk, not zeros.
    pub fn alloc(&self) -> Result<PhysPageNum, MmError> {
        let off = NoMigrate::new(&*self.hart);
        let cpu = off.cpu();
        // 先放开本核链表的锁再去偷，steal 还会再锁一次本核链表
        let local = self.local(cpu).lock().pop();
        let ppn = local.or_else(|| self.steal());
        drop(off);
        let ppn = ppn.ok_or(MmError::OutOfFrames)?;
        ppn.get_bytes_array().fill(ALLOC_JUNK);
        trace!("[kernel] cpu {} alloc {:?}", cpu, ppn);
        Ok(ppn)
    }

    /// Pop one frame from the first non-empty list, each lock held only for the pop.
    fn steal(&self) -> Option<PhysPageNum> {
        self.freelists.iter().find_map(|list| list.lock().pop())
    }

    /// Give a frame back to the caller's list.
    ///
    /// Panics if `ppn` was never managed by this allocator.
    pub fn dealloc(&self, ppn: PhysPageNum) {
        if !self.range.contains(ppn) {
            panic!("frame {:?} is outside the managed range", ppn);
        }
        // Fill with junk to catch dangling refs.
        ppn.get_bytes_array().fill(FREE_JUNK);
        let off = NoMigrate::new(&*self.hart);
        self.local(off.cpu()).lock().push(ppn);
    }

    /// Frames currently free, summed over all cores
    pub fn free_frames(&self) -> usize {
        self.freelists.iter().map(|list| list.lock().len()).sum()
    }

    /// Frames currently on the free list of `cpu`
    pub fn free_frames_on(&self, cpu: usize) -> usize {
        self.local(cpu).lock().len()
    }

    /// Total frames under management
    pub fn total_frames(&self) -> usize {
        self.range.get_end().0 - self.range.get_start().0
    }

    pub fn contains(&self, ppn: PhysPageNum) -> bool {
        self.range.contains(ppn)
    }
}

/// An owned frame, handed back to its allocator on drop
pub struct FrameTracker {
    pub ppn: PhysPageNum,
    allocator: Arc<FrameAllocator>,
}

impl FrameTracker {
    /// Take ownership of `ppn` and clear it
    fn new(ppn: PhysPageNum, allocator: Arc<FrameAllocator>) -> Self {
        ppn.get_bytes_array().fill(0);
        Self { ppn, allocator }
    }
}

impl Debug for FrameTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("FrameTracker:PPN={:#x}", self.ppn.0))
    }
}

impl Drop for FrameTracker {
    fn drop(&mut self) {
        self.allocator.dealloc(self.ppn);
    }
}

/// Allocate a zero-filled frame owned by the returned tracker
pub fn frame_alloc(allocator: &Arc<FrameAllocator>) -> Result<FrameTracker, MmError> {
    allocator
        .alloc()
        .map(|ppn| FrameTracker::new(ppn, Arc::clone(allocator)))
}
