//! Memory management implementation
//!
//! SV39 page-based virtual-memory architecture for RV64 systems: the per-core
//! frame allocator, page table, and the memory set that maps files into a
//! process on demand.
//!
//! Every task or process has a memory_set to control its mapped files.

mod address;
mod frame_allocator;
mod memory_set;
mod page_table;
mod phys_region;

use crate::fs::FsError;
use thiserror::Error;

use address::PPNRange;
pub use address::{PhysAddr, PhysPageNum, StepByOne, VPNRange, VirtAddr, VirtPageNum};
pub use frame_allocator::{frame_alloc, FrameAllocator, FrameTracker};
pub use memory_set::{MapFlags, MapProt, MemorySet, Vma};
pub use page_table::{PTEFlags, PageTable, PageTableEntry};
pub use phys_region::PhysRegion;

/// Errors of the memory subsystem
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    #[error("out of physical frames")]
    OutOfFrames,
    /// a non-zero address hint or file offset
    #[error("unsupported mmap argument")]
    Unsupported,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("mapping exceeds the file's access mode")]
    PermissionDenied,
    #[error("no free vma slot")]
    NoVmaSlot,
    #[error("no room for {0:#x} bytes of mappings")]
    NoAddressSpace(usize),
    #[error("no mapping at {0:#x}")]
    BadAddress(usize),
    /// munmap of a hole would split one vma into two
    #[error("unmap would split a mapping")]
    Split,
    #[error("short write-back at file offset {offset:#x}")]
    ShortIo { offset: usize },
    #[error(transparent)]
    Fs(#[from] FsError),
}

pub type Result<T> = core::result::Result<T, MmError>;
