//! `Arc<Inode>` -> `OSInode`: an inode is shared by every open file that
//! refers to it, while each `OSInode` carries the access mode it was opened
//! with.
//!
//! An inode keeps its data in a contiguous run of blocks on one device and
//! moves every byte through the block cache. Where those blocks come from
//! (the on-disk layout) is up to whoever builds the [`Extent`].
use super::{File, FsError};
use crate::config::MAX_WRITE_BYTES;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bcache::{BlockCache, BLOCK_SZ};
use spin::Mutex;

/// Blocks `[start, start + nblocks)` of device `dev`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub dev: usize,
    pub start: usize,
    pub nblocks: usize,
}

/// An in-memory inode backed by an extent
pub struct Inode {
    cache: Arc<BlockCache>,
    extent: Extent,
    // inode 锁：read_at/write_at 全程持有，保证 size 与块内容一致
    inner: Mutex<InodeInner>,
}

struct InodeInner {
    size: usize,
}

impl Inode {
    pub fn new(cache: Arc<BlockCache>, extent: Extent, size: usize) -> Self {
        assert!(size <= extent.nblocks * BLOCK_SZ, "size beyond the extent");
        Self {
            cache,
            extent,
            inner: Mutex::new(InodeInner { size }),
        }
    }
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }
    /// Bytes the extent can hold
    pub fn capacity(&self) -> usize {
        self.extent.nblocks * BLOCK_SZ
    }
    pub fn extent(&self) -> Extent {
        self.extent
    }
    /// Read data from current inode
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let inner = self.inner.lock();
        let end = (offset + buf.len()).min(inner.size);
        let mut start = offset;
        let mut read_size = 0usize;
        while start < end {
            let block = start / BLOCK_SZ;
            let block_end = ((block + 1) * BLOCK_SZ).min(end);
            let len = block_end - start;
            let cached = self.cache.read(self.extent.dev, self.extent.start + block)?;
            let inner_off = start % BLOCK_SZ;
            buf[read_size..read_size + len].copy_from_slice(&cached.data()[inner_off..inner_off + len]);
            read_size += len;
            start = block_end;
        }
        Ok(read_size)
    }
    /// Write data to current inode, growing it up to the extent's capacity.
    ///
    /// One call is one filesystem operation: it may not carry more than
    /// `MAX_WRITE_BYTES`. Larger writes are the caller's to split.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, FsError> {
        if buf.len() > MAX_WRITE_BYTES {
            return Err(FsError::TooLarge(buf.len()));
        }
        let mut inner = self.inner.lock();
        let end = (offset + buf.len()).min(self.capacity());
        let mut start = offset;
        let mut write_size = 0usize;
        while start < end {
            let block = start / BLOCK_SZ;
            let block_end = ((block + 1) * BLOCK_SZ).min(end);
            let len = block_end - start;
            let inner_off = start % BLOCK_SZ;
            let mut cached = self.cache.read(self.extent.dev, self.extent.start + block)?;
            cached.data_mut()[inner_off..inner_off + len]
                .copy_from_slice(&buf[write_size..write_size + len]);
            cached.write()?;
            drop(cached);
            write_size += len;
            start = block_end;
            inner.size = inner.size.max(start);
        }
        Ok(write_size)
    }
}

/// A wrapper around a filesystem inode
/// to implement File trait atop
pub struct OSInode {
    readable: bool,
    writable: bool,
    inode: Arc<Inode>,
}

impl OSInode {
    /// Construct an OS inode from a inode
    pub fn new(readable: bool, writable: bool, inode: Arc<Inode>) -> Self {
        Self {
            readable,
            writable,
            inode,
        }
    }
    /// Read all data inside a inode into vector
    pub fn read_all(&self) -> Result<Vec<u8>, FsError> {
        let mut buffer = [0u8; BLOCK_SZ];
        let mut v: Vec<u8> = Vec::new();
        loop {
            let len = self.inode.read_at(v.len(), &mut buffer)?;
            if len == 0 {
                break;
            }
            v.extend_from_slice(&buffer[..len]);
        }
        Ok(v)
    }
}

impl File for OSInode {
    fn readable(&self) -> bool {
        self.readable
    }
    fn writable(&self) -> bool {
        self.writable
    }
    fn size(&self) -> usize {
        self.inode.size()
    }
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        if !self.readable {
            return Err(FsError::NotReadable);
        }
        self.inode.read_at(offset, buf)
    }
    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, FsError> {
        if !self.writable {
            return Err(FsError::NotWritable);
        }
        self.inode.write_at(offset, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcache::{BlockDevice, CacheConfig, RamDisk};
    use alloc::vec;

    fn inode(size: usize) -> (Arc<RamDisk>, Arc<Inode>) {
        let disk = Arc::new(RamDisk::new(32));
        let cache = Arc::new(BlockCache::new(
            CacheConfig::default(),
            vec![disk.clone() as Arc<dyn BlockDevice>],
        ));
        let extent = Extent {
            dev: 0,
            start: 4,
            nblocks: 8,
        };
        (disk, Arc::new(Inode::new(cache, extent, size)))
    }

    #[test]
    fn write_then_read_across_blocks() {
        let (disk, inode) = inode(0);
        let data: Vec<u8> = (0..2500).map(|i| i as u8).collect();
        assert_eq!(inode.write_at(100, &data).unwrap(), 2500);
        assert_eq!(inode.size(), 2600);
        let mut back = vec![0u8; 2500];
        assert_eq!(inode.read_at(100, &mut back).unwrap(), 2500);
        assert_eq!(back, data);
        // written through to the extent on disk
        let mut raw = [0u8; 4];
        disk.peek(4 * BLOCK_SZ + 100, &mut raw);
        assert_eq!(raw, [0, 1, 2, 3]);
    }

    #[test]
    fn read_stops_at_end_of_file() {
        let (_disk, inode) = inode(0);
        inode.write_at(0, b"hello").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(inode.read_at(3, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(inode.read_at(5, &mut buf).unwrap(), 0);
    }

    #[test]
    fn failed_write_is_not_visible_to_readers() {
        let (disk, inode) = inode(0);
        inode.write_at(0, b"original").unwrap();
        disk.set_read_only(true);
        assert!(matches!(inode.write_at(0, b"CHANGED!"), Err(FsError::Cache(_))));
        disk.set_read_only(false);
        // 缓存里不会留下没有落盘的数据
        let file = OSInode::new(true, false, inode);
        assert_eq!(file.read_all().unwrap(), b"original");
        let mut raw = [0u8; 8];
        disk.peek(4 * BLOCK_SZ, &mut raw);
        assert_eq!(&raw, b"original");
    }

    #[test]
    fn oversized_write_is_refused() {
        let (_disk, inode) = inode(0);
        let big = vec![1u8; MAX_WRITE_BYTES + 1];
        assert_eq!(inode.write_at(0, &big), Err(FsError::TooLarge(MAX_WRITE_BYTES + 1)));
        assert_eq!(inode.size(), 0);
    }

    #[test]
    fn access_mode_is_enforced() {
        let (_disk, inode) = inode(0);
        let ro = OSInode::new(true, false, inode.clone());
        let wo = OSInode::new(false, true, inode);
        assert_eq!(ro.write_at(0, b"x"), Err(FsError::NotWritable));
        assert_eq!(wo.write_at(0, b"abc"), Ok(3));
        assert_eq!(wo.read_at(0, &mut [0u8; 3]), Err(FsError::NotReadable));
        assert_eq!(ro.read_all().unwrap(), b"abc");
    }
}
