//! Constants used in rCore-style memory management

/// Bytes per page and per frame
pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_SIZE_BITS: usize = 0xc;

/// Default number of cores, i.e. of per-core free lists
pub const NCPU: usize = 8;

/// VMA slots per process
pub const NVMA: usize = 16;
/// Lowest address `mmap` hands out
pub const MMAP_MIN_ADDR: usize = 0x20_0000_0000;
/// `mmap` regions stay below this address (top of the SV39 lower half)
pub const MMAP_MAX_ADDR: usize = 1 << 38;

// 一次写操作在日志里最多占 MAXOPBLOCKS 个块，扣掉 inode、位图等元数据块后剩下的才能装数据
/// Largest byte count one write call may carry
pub const MAX_WRITE_BYTES: usize = ((bcache::MAXOPBLOCKS - 1 - 1 - 2) / 2) * bcache::BLOCK_SZ;

/// Fill pattern for freed frames, to catch dangling references
pub const FREE_JUNK: u8 = 1;
/// Fill pattern for freshly allocated frames
pub const ALLOC_JUNK: u8 = 5;
