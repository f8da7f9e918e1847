use super::{BlockDevice, BlockDeviceError, BLOCK_SZ};
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

/// A block device kept entirely in memory
pub struct RamDisk {
    blocks: Mutex<Vec<u8>>,
    nblocks: usize,
    read_only: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    /// A zero-filled disk of `nblocks` blocks
    pub fn new(nblocks: usize) -> Self {
        Self {
            blocks: Mutex::new(vec![0u8; nblocks * BLOCK_SZ]),
            nblocks,
            read_only: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }
    /// Reject every following write with [`BlockDeviceError::ReadOnly`]
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }
    /// Number of `read_block` calls served so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
    /// Number of `write_block` calls served so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
    /// Copy raw bytes out of the disk, bypassing any cache
    pub fn peek(&self, offset: usize, buf: &mut [u8]) {
        let blocks = self.blocks.lock();
        buf.copy_from_slice(&blocks[offset..offset + buf.len()]);
    }
    fn range(&self, block_id: usize) -> Result<core::ops::Range<usize>, BlockDeviceError> {
        if block_id >= self.nblocks {
            return Err(BlockDeviceError::OutOfRange(block_id));
        }
        Ok(block_id * BLOCK_SZ..(block_id + 1) * BLOCK_SZ)
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), BlockDeviceError> {
        let range = self.range(block_id)?;
        buf.copy_from_slice(&self.blocks.lock()[range]);
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), BlockDeviceError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(BlockDeviceError::ReadOnly);
        }
        let range = self.range(block_id)?;
        self.blocks.lock()[range].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
