//! A sharded block cache with global-LRU recycling.
//!
//! Disk blocks are cached in a fixed pool of buffers. Each buffer lives in
//! exactly one hash bucket (chosen by block number), and every bucket keeps
//! its members on a recency-ordered list guarded by its own lock, so a hit
//! only ever touches one bucket. Misses are serialized by a global lock and
//! recycle the least recently released buffer of the whole cache.
#![no_std]
extern crate alloc;
#[cfg(test)]
extern crate std;

mod block_cache;
mod block_dev;
mod bucket;
mod error;
mod ramdisk;

/// Size of one cached block, in bytes
pub const BLOCK_SZ: usize = 1024;
/// Max number of blocks any single filesystem operation writes
pub const MAXOPBLOCKS: usize = 10;
/// Default number of buffers in the cache
pub const NBUF: usize = MAXOPBLOCKS * 3;
/// Default number of hash buckets
pub const NBUCKETS: usize = 13;

pub use block_cache::{BlockCache, BufGuard, CacheConfig, CacheStats, PinnedBuf};
pub use block_dev::BlockDevice;
pub use error::{BlockDeviceError, CacheError, Result};
pub use ramdisk::RamDisk;
