use super::bucket::{Bucket, Links};
use super::{BlockDevice, CacheError, Result, BLOCK_SZ, NBUCKETS, NBUF};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::ManuallyDrop;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use log::{error, trace, warn};
use spin::{Mutex, MutexGuard};

/// Device id of a buffer that has never held a block
const NO_DEV: usize = usize::MAX;

/// Sizing of a [`BlockCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// number of buffers
    pub nbuf: usize,
    /// number of hash buckets
    pub nbuckets: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            nbuf: NBUF,
            nbuckets: NBUCKETS,
        }
    }
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    /// misses that threw out a previously cached block
    pub evictions: usize,
}

/// Counters only touched under the global lock
#[derive(Default)]
struct MissCounters {
    misses: usize,
    evictions: usize,
}

// 块内容按 8 字节对齐，这样 read/modify 可以把其中的一段解释为磁盘上的数据结构
#[repr(C, align(8))]
struct BlockData([u8; BLOCK_SZ]);

/// Identity and bookkeeping of one buffer.
///
/// `dev`/`blockno` change only under the global lock plus the lock of the
/// bucket the buffer sits in; `refcnt` changes under the bucket lock
/// (acquire/release) or the global lock (pin/unpin); `valid` changes under
/// the content lock, or during recycling when nobody can hold it. A
/// decrement of `refcnt` to zero is done under the bucket lock after the
/// content lock has been dropped, so whoever sees zero under that lock also
/// sees the last holder's writes to the content.
struct BufMeta {
    // 缓冲区当前对应的设备号与块号
    dev: AtomicUsize,
    blockno: AtomicUsize,
    // 内容是否已经从磁盘读入
    valid: AtomicBool,
    // 持有者个数，为 0 时才可以被回收
    refcnt: AtomicUsize,
    // 最近一次引用计数降为 0 的时刻
    timestamp: AtomicU64,
}

struct Buf {
    meta: BufMeta,
    /// the content lock
    data: Mutex<BlockData>,
}

impl Buf {
    fn new() -> Self {
        Self {
            meta: BufMeta {
                dev: AtomicUsize::new(NO_DEV),
                blockno: AtomicUsize::new(0),
                valid: AtomicBool::new(false),
                refcnt: AtomicUsize::new(0),
                timestamp: AtomicU64::new(0),
            },
            data: Mutex::new(BlockData([0; BLOCK_SZ])),
        }
    }
    fn is(&self, dev: usize, blockno: usize) -> bool {
        self.meta.dev.load(Ordering::Relaxed) == dev
            && self.meta.blockno.load(Ordering::Relaxed) == blockno
    }
}

/// Cache of disk blocks shared by every core.
///
/// Lock order: the global lock, then at most one bucket lock. The only
/// moment a second bucket lock is taken is when a recycled buffer moves to
/// its new bucket, and the old bucket lock is dropped before that.
pub struct BlockCache {
    /// serializes misses
    lock: Mutex<MissCounters>,
    bufs: Vec<Buf>,
    // 按块号散列的桶，每个桶一把锁
    buckets: Vec<Mutex<Bucket>>,
    // 所有桶共用的链表节点
    links: Links,
    // 设备号就是在这个向量里的下标
    devices: Vec<Arc<dyn BlockDevice>>,
    /// release clock used as the recency timestamp
    ticks: AtomicU64,
    hits: AtomicUsize,
}

impl BlockCache {
    /// Create a cache over `devices`; a device id is its index in the vector.
    pub fn new(config: CacheConfig, devices: Vec<Arc<dyn BlockDevice>>) -> Self {
        let CacheConfig { nbuf, nbuckets } = config;
        assert!(nbuf > 0 && nbuckets > 0, "empty block cache");
        let links = Links::new(nbuf + nbuckets);
        let buckets: Vec<Mutex<Bucket>> = (0..nbuckets)
            .map(|i| Mutex::new(Bucket::new(nbuf + i)))
            .collect();
        // 初始时所有缓冲区都挂在 0 号桶上，第一次被回收时才会搬到各自的桶里
        {
            let mut first = buckets[0].lock();
            for id in 0..nbuf {
                links.push_front(&mut first, id);
            }
        }
        Self {
            lock: Mutex::new(MissCounters::default()),
            bufs: (0..nbuf).map(|_| Buf::new()).collect(),
            buckets,
            links,
            devices,
            ticks: AtomicU64::new(0),
            hits: AtomicUsize::new(0),
        }
    }

    fn hash(&self, blockno: usize) -> usize {
        blockno % self.buckets.len()
    }

    fn device(&self, dev: usize) -> Result<&Arc<dyn BlockDevice>> {
        self.devices.get(dev).ok_or(CacheError::NoSuchDevice(dev))
    }

    fn lookup(&self, bucket: &Bucket, dev: usize, blockno: usize) -> Option<usize> {
        self.links
            .iter_mru(bucket)
            .find(|&id| self.bufs[id].is(dev, blockno))
    }

    /// Find the buffer of `(dev, blockno)` or recycle one for it.
    /// The returned buffer already carries the caller's reference.
    fn get(&self, dev: usize, blockno: usize) -> Result<usize> {
        let key = self.hash(blockno);

        // first phase: look only at the home bucket
        {
            let bucket = self.buckets[key].lock();
            if let Some(id) = self.lookup(&bucket, dev, blockno) {
                self.bufs[id].meta.refcnt.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(id);
            }
        }

        // second phase: atomic find and insert
        let mut counters = self.lock.lock();
        // 两个阶段之间别的核可能已经把这个块装进来了，必须在全局锁下再查一次
        {
            let bucket = self.buckets[key].lock();
            if let Some(id) = self.lookup(&bucket, dev, blockno) {
                self.bufs[id].meta.refcnt.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(id);
            }
        }
        counters.misses += 1;

        loop {
            let (id, from) = match self.find_victim() {
                Some(victim) => victim,
                None => {
                    warn!("[bcache] no buffers for dev {} block {}", dev, blockno);
                    return Err(CacheError::NoBuffers);
                }
            };
            let mut old = self.buckets[from].lock();
            let meta = &self.bufs[id].meta;
            // a hit in that bucket may have taken it after the scan let go
            if meta.refcnt.load(Ordering::Relaxed) != 0 {
                continue;
            }
            // 换成新的块，内容作废，等第一次 read 时再从磁盘读入
            let old_dev = meta.dev.swap(dev, Ordering::Relaxed);
            let old_blockno = meta.blockno.swap(blockno, Ordering::Relaxed);
            meta.valid.store(false, Ordering::Relaxed);
            meta.refcnt.store(1, Ordering::Relaxed);
            if old_dev != NO_DEV {
                counters.evictions += 1;
                trace!(
                    "[bcache] recycle buf {}: ({}, {}) -> ({}, {})",
                    id,
                    old_dev,
                    old_blockno,
                    dev,
                    blockno
                );
            }
            // 不在目标桶里就挪过去，先放开旧桶的锁再锁新桶
            if from != key {
                self.links.unlink(&mut old, id);
                drop(old);
                let mut new = self.buckets[key].lock();
                self.links.push_front(&mut new, id);
            }
            return Ok(id);
        }
    }

    /// Scan every bucket for the unreferenced buffer released longest ago.
    /// Caller holds the global lock. Returns `(buffer, bucket)`.
    ///
    /// Each bucket is walked from its least-recently-used end and the walk
    /// stops at the first buffer older than the best seen so far, so a
    /// bucket whose list is out of stamp order (a buffer that dropped to
    /// zero references through `unpin` keeps its place and stamp) may hand
    /// over a buffer that is not its oldest. Ties go to the earlier bucket.
    fn find_victim(&self) -> Option<(usize, usize)> {
        let mut best = None;
        let mut best_stamp = u64::MAX;
        for (i, bucket) in self.buckets.iter().enumerate() {
            let bucket = bucket.lock();
            for id in self.links.iter_lru(&bucket) {
                let meta = &self.bufs[id].meta;
                if meta.refcnt.load(Ordering::Relaxed) > 0 {
                    continue;
                }
                let stamp = meta.timestamp.load(Ordering::Relaxed);
                if stamp < best_stamp {
                    best = Some((id, i));
                    best_stamp = stamp;
                    break;
                }
            }
        }
        best
    }

    /// Return a buffer bound to `(dev, blockno)` with its content lock held.
    /// The content is whatever the buffer holds; check [`BufGuard::valid`].
    /// Blocks while another holder is using the same buffer.
    pub fn acquire(&self, dev: usize, blockno: usize) -> Result<BufGuard<'_>> {
        self.device(dev)?;
        let id = self.get(dev, blockno)?;
        let data = self.bufs[id].data.lock();
        Ok(BufGuard {
            cache: self,
            id,
            data: ManuallyDrop::new(data),
        })
    }

    /// Return a locked buffer holding the content of `(dev, blockno)`,
    /// reading it from the device if it is not cached yet.
    pub fn read(&self, dev: usize, blockno: usize) -> Result<BufGuard<'_>> {
        let mut buf = self.acquire(dev, blockno)?;
        if !buf.valid() {
            let device = self.device(dev)?;
            if let Err(source) = device.read_block(blockno, &mut buf.data.0) {
                error!("[bcache] read dev {} block {}: {}", dev, blockno, source);
                return Err(CacheError::Io {
                    dev,
                    blockno,
                    source,
                });
            }
            self.bufs[buf.id].meta.valid.store(true, Ordering::Relaxed);
        }
        Ok(buf)
    }

    /// Write a held buffer through to its device.
    ///
    /// If the device refuses the write the buffer is marked invalid, so the
    /// next reader loads the block again instead of seeing bytes that never
    /// reached the disk.
    pub fn write(&self, buf: &BufGuard<'_>) -> Result<()> {
        debug_assert!(core::ptr::eq(self, buf.cache));
        let (dev, blockno) = (buf.dev(), buf.blockno());
        self.device(dev)?
            .write_block(blockno, &buf.data.0)
            .map_err(|source| {
                error!("[bcache] write dev {} block {}: {}", dev, blockno, source);
                // 持有内容锁，可以直接作废缓存里的副本
                self.bufs[buf.id].meta.valid.store(false, Ordering::Relaxed);
                CacheError::Io {
                    dev,
                    blockno,
                    source,
                }
            })
    }

    /// Give a buffer back. Same as dropping the guard.
    pub fn release(&self, buf: BufGuard<'_>) {
        drop(buf);
    }

    /// Drop one reference: the content lock is already gone when this runs.
    fn brelse(&self, id: usize) {
        let meta = &self.bufs[id].meta;
        let key = self.hash(meta.blockno.load(Ordering::Relaxed));
        let mut bucket = self.buckets[key].lock();
        let prev = meta.refcnt.fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "brelse: buf {} is not referenced", id);
        if prev == 1 {
            // no one is waiting for it.
            let now = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
            meta.timestamp.store(now, Ordering::Relaxed);
            self.links.move_to_front(&mut bucket, id);
        }
    }

    /// Keep a held buffer resident after its guard is released.
    pub fn pin<'a>(&'a self, buf: &BufGuard<'a>) -> PinnedBuf<'a> {
        let _lock = self.lock.lock();
        self.bufs[buf.id].meta.refcnt.fetch_add(1, Ordering::Relaxed);
        PinnedBuf {
            cache: self,
            id: buf.id,
        }
    }

    /// Undo a [`pin`](Self::pin). Same as dropping the pin.
    pub fn unpin(&self, pinned: PinnedBuf<'_>) {
        drop(pinned);
    }

    fn bunpin(&self, id: usize) {
        let _lock = self.lock.lock();
        let prev = self.bufs[id].meta.refcnt.fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "bunpin: buf {} is not referenced", id);
    }

    pub fn stats(&self) -> CacheStats {
        let counters = self.lock.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: counters.misses,
            evictions: counters.evictions,
        }
    }

    /// Number of buffers in the cache
    pub fn capacity(&self) -> usize {
        self.bufs.len()
    }

    /// How many buffers are currently bound to `(dev, blockno)`.
    #[cfg(test)]
    fn bound(&self, dev: usize, blockno: usize) -> usize {
        let _lock = self.lock.lock();
        self.bufs.iter().filter(|b| b.is(dev, blockno)).count()
    }
}

/// A cached block with its content lock held.
///
/// Dropping the guard releases the buffer: the content lock first, then the
/// reference, which moves the buffer to the recently-used end of its bucket
/// once nobody else holds it.
pub struct BufGuard<'a> {
    cache: &'a BlockCache,
    id: usize,
    data: ManuallyDrop<MutexGuard<'a, BlockData>>,
}

impl<'a> BufGuard<'a> {
    pub fn dev(&self) -> usize {
        self.cache.bufs[self.id].meta.dev.load(Ordering::Relaxed)
    }
    pub fn blockno(&self) -> usize {
        self.cache.bufs[self.id].meta.blockno.load(Ordering::Relaxed)
    }
    /// Whether the content has been loaded from the device
    pub fn valid(&self) -> bool {
        self.cache.bufs[self.id].meta.valid.load(Ordering::Relaxed)
    }
    pub fn data(&self) -> &[u8] {
        &self.data.0
    }
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data.0
    }
    /// View the bytes at `offset` as a `T` and run `f` on it
    pub fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        Self::check::<T>(offset);
        let addr = &self.data.0[offset] as *const u8;
        f(unsafe { &*(addr as *const T) })
    }
    /// View the bytes at `offset` as a mutable `T` and run `f` on it
    pub fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        Self::check::<T>(offset);
        let addr = &mut self.data.0[offset] as *mut u8;
        f(unsafe { &mut *(addr as *mut T) })
    }
    fn check<T>(offset: usize) {
        // 确认该数据结构被整个包含在块内，并且地址满足 T 的对齐要求
        assert!(offset + core::mem::size_of::<T>() <= BLOCK_SZ);
        assert!(core::mem::align_of::<T>() <= 8 && offset % core::mem::align_of::<T>() == 0);
    }
    /// Write the content through to the device. Keeps the lock and reference.
    pub fn write(&self) -> Result<()> {
        self.cache.write(self)
    }
    /// Take an extra reference that outlives this guard.
    pub fn pin(&self) -> PinnedBuf<'a> {
        self.cache.pin(self)
    }
}

impl Drop for BufGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the content guard is dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.data) };
        self.cache.brelse(self.id);
    }
}

/// An extra reference on a buffer, keeping it from being recycled.
/// Dropping it unpins the buffer.
#[must_use]
pub struct PinnedBuf<'a> {
    cache: &'a BlockCache,
    id: usize,
}

impl PinnedBuf<'_> {
    pub fn blockno(&self) -> usize {
        self.cache.bufs[self.id].meta.blockno.load(Ordering::Relaxed)
    }
}

impl Drop for PinnedBuf<'_> {
    fn drop(&mut self) {
        self.cache.bunpin(self.id);
    }
}
