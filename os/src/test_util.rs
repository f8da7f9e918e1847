//! Host stand-ins for cores, memory and disks used by the unit tests
use crate::config::{MAX_WRITE_BYTES, NCPU};
use crate::fs::{Extent, File, Inode, OSInode};
use crate::mm::{FrameAllocator, PhysRegion};
use crate::sync::Hart;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bcache::{BlockCache, BlockDevice, CacheConfig, RamDisk, BLOCK_SZ};
use core::cell::Cell;

std::thread_local! {
    static CPU: Cell<usize> = Cell::new(0);
    static NOFF: Cell<usize> = Cell::new(0);
}

/// Make the calling thread run as core `cpu`
pub fn bind_cpu(cpu: usize) {
    CPU.with(|c| c.set(cpu));
}

/// Each test thread is one core, chosen with [`bind_cpu`]
pub struct ThreadHart;

impl Hart for ThreadHart {
    fn id(&self) -> usize {
        CPU.with(|c| c.get())
    }
    fn push_off(&self) {
        NOFF.with(|n| n.set(n.get() + 1));
    }
    fn pop_off(&self) {
        NOFF.with(|n| {
            assert!(n.get() > 0, "pop_off");
            n.set(n.get() - 1);
        });
    }
}

const DISK_BLOCKS: usize = 256;

/// A frame pool, a ram disk and a cache over it
pub struct TestEnv {
    pub frames: Arc<FrameAllocator>,
    pub disk: Arc<RamDisk>,
    pub cache: Arc<BlockCache>,
    next_block: Cell<usize>,
}

impl TestEnv {
    pub fn new(frames: usize) -> Self {
        bind_cpu(0);
        let disk = Arc::new(RamDisk::new(DISK_BLOCKS));
        let cache = Arc::new(BlockCache::new(
            CacheConfig::default(),
            vec![disk.clone() as Arc<dyn BlockDevice>],
        ));
        Self {
            frames: Arc::new(FrameAllocator::from_region(
                PhysRegion::new(frames),
                NCPU,
                Arc::new(ThreadHart),
            )),
            disk,
            cache,
            next_block: Cell::new(1),
        }
    }
    /// A fresh inode of `nblocks` blocks holding `content`
    pub fn inode(&self, content: &[u8], nblocks: usize) -> Arc<Inode> {
        let start = self.next_block.get();
        self.next_block.set(start + nblocks);
        let extent = Extent {
            dev: 0,
            start,
            nblocks,
        };
        let inode = Arc::new(Inode::new(self.cache.clone(), extent, 0));
        for (i, chunk) in content.chunks(MAX_WRITE_BYTES).enumerate() {
            assert_eq!(inode.write_at(i * MAX_WRITE_BYTES, chunk).unwrap(), chunk.len());
        }
        inode
    }
    /// Open `inode` with the given `(readable, writable)` mode
    pub fn open(&self, inode: &Arc<Inode>, (readable, writable): (bool, bool)) -> Arc<dyn File> {
        Arc::new(OSInode::new(readable, writable, inode.clone()))
    }
    /// Bytes of `inode` as they are on the disk, past the cache
    pub fn disk_bytes(&self, inode: &Inode, offset: usize, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.disk.peek(inode.extent().start * BLOCK_SZ + offset, &mut buf);
        buf
    }
}
