//! Implementation of [`Vma`] and [`MemorySet`].
//!
//! A memory set holds a process's page table and its table of mapped-file
//! areas. Nothing is populated at `mmap` time: each page is read from the
//! file on its first fault, and dirty pages of shared mappings are written
//! back when they are unmapped.

use super::{frame_alloc, FrameAllocator, FrameTracker, MmError, Result};
use super::{PTEFlags, PageTable, PageTableEntry};
use super::{PhysPageNum, VPNRange, VirtAddr, VirtPageNum};
use crate::config::{MAX_WRITE_BYTES, MMAP_MAX_ADDR, MMAP_MIN_ADDR, NVMA, PAGE_SIZE};
use crate::fs::File;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{debug, error, trace, warn};

bitflags! {
    /// page protection requested by mmap
    pub struct MapProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

bitflags! {
    /// sharing mode requested by mmap; exactly one must be set
    pub struct MapFlags: u32 {
        /// stores reach the file when the page is unmapped
        const SHARED = 1 << 0;
        /// stores stay private and are dropped on unmap
        const PRIVATE = 1 << 1;
    }
}

/// One mapped range of a file
pub struct Vma {
    // 当前仍然映射着的页范围，munmap 掉前缀或后缀后会收缩
    vpn_range: VPNRange,
    // 映射建立时的起始页，文件偏移 0 对应这里，收缩前缀后也不变
    base: VirtPageNum,
    prot: MapProt,
    flags: MapFlags,
    file: Arc<dyn File>,
    data_frames: BTreeMap<VirtPageNum, FrameTracker>,
}

impl Vma {
    fn new(start: VirtPageNum, end: VirtPageNum, prot: MapProt, flags: MapFlags, file: Arc<dyn File>) -> Self {
        Self {
            vpn_range: VPNRange::new(start, end),
            base: start,
            prot,
            flags,
            file,
            data_frames: BTreeMap::new(),
        }
    }
    /// Same range, mode and file, with nothing resident
    fn from_another(another: &Self) -> Self {
        Self {
            vpn_range: another.vpn_range,
            base: another.base,
            prot: another.prot,
            flags: another.flags,
            file: Arc::clone(&another.file),
            data_frames: BTreeMap::new(),
        }
    }
    pub fn start(&self) -> VirtAddr {
        self.vpn_range.get_start().into()
    }
    pub fn end(&self) -> VirtAddr {
        self.vpn_range.get_end().into()
    }
    pub fn prot(&self) -> MapProt {
        self.prot
    }
    pub fn flags(&self) -> MapFlags {
        self.flags
    }
    pub fn is_shared(&self) -> bool {
        self.flags.contains(MapFlags::SHARED)
    }
    /// Number of pages faulted in and still mapped
    pub fn resident(&self) -> usize {
        self.data_frames.len()
    }
    pub fn contains(&self, vpn: VirtPageNum) -> bool {
        self.vpn_range.contains(vpn)
    }
    fn file_offset(&self, vpn: VirtPageNum) -> usize {
        (vpn.0 - self.base.0) * PAGE_SIZE
    }
    fn pte_flags(&self) -> PTEFlags {
        let mut flags = PTEFlags::U;
        if self.prot.contains(MapProt::READ) {
            flags |= PTEFlags::R;
        }
        // SV39 把 W 且非 R 的组合保留，可写的页总是同时可读
        if self.prot.contains(MapProt::WRITE) {
            flags |= PTEFlags::R | PTEFlags::W;
        }
        flags
    }
    /// Write every dirty resident page in `range` back to the file, in
    /// chunks no larger than one write operation may carry. Touches no
    /// mapping state, so a failure leaves the pages resident and dirty.
    fn write_back(&self, page_table: &PageTable, range: VPNRange) -> Result<()> {
        if !self.is_shared() {
            return Ok(());
        }
        for (&vpn, frame) in self.data_frames.range(range.get_start()..range.get_end()) {
            let dirty = page_table.translate(vpn).map_or(false, |pte| pte.is_dirty());
            if !dirty {
                continue;
            }
            let offset = self.file_offset(vpn);
            let size = self.file.size();
            if offset >= size {
                continue;
            }
            let len = (size - offset).min(PAGE_SIZE);
            let bytes = &frame.ppn.get_bytes_array()[..len];
            let mut done = 0;
            while done < len {
                let n = (len - done).min(MAX_WRITE_BYTES);
                let written = self.file.write_at(offset + done, &bytes[done..done + n])?;
                if written != n {
                    return Err(MmError::ShortIo { offset: offset + done });
                }
                done += n;
            }
            trace!("[kernel] write back {:?}, {} bytes at {:#x}", vpn, len, offset);
        }
        Ok(())
    }
    /// Drop the frames of `range` and clear their entries
    fn unmap_range(&mut self, page_table: &mut PageTable, range: VPNRange) {
        for vpn in range {
            if self.data_frames.remove(&vpn).is_some() {
                page_table.unmap(vpn);
            }
        }
    }
}

/// memory set structure, controls the mapped files of one process
pub struct MemorySet {
    page_table: PageTable,
    // 固定 NVMA 个槽位，None 表示空闲
    vmas: Vec<Option<Vma>>,
    // 缺页时从这里分配物理页帧
    frame_allocator: Arc<FrameAllocator>,
}

impl MemorySet {
    // 新建一个空的地址空间
    pub fn new_bare(frame_allocator: &Arc<FrameAllocator>) -> Result<Self> {
        Ok(Self {
            page_table: PageTable::new(frame_allocator)?,
            vmas: (0..NVMA).map(|_| None).collect(),
            frame_allocator: Arc::clone(frame_allocator),
        })
    }
    pub fn token(&self) -> usize {
        self.page_table.token()
    }
    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.page_table.translate(vpn)
    }
    /// Live mappings, in slot order
    pub fn vmas(&self) -> impl Iterator<Item = &Vma> {
        self.vmas.iter().flatten()
    }
    pub fn find_vma(&self, va: VirtAddr) -> Option<&Vma> {
        let vpn = va.floor();
        self.vmas().find(|vma| vma.contains(vpn))
    }

    /// Map `len` bytes of `file` and return the chosen base address.
    ///
    /// Only `addr == 0` and `offset == 0` are supported: the mapping starts at
    /// the beginning of the file and its address is picked here. The region
    /// is rounded up to whole pages. No frame is allocated and no I/O is
    /// done until the first access faults.
    pub fn mmap(
        &mut self,
        addr: usize,
        len: usize,
        prot: MapProt,
        flags: MapFlags,
        file: Arc<dyn File>,
        offset: usize,
    ) -> Result<usize> {
        if addr != 0 || offset != 0 {
            warn!("[kernel] mmap: addr {:#x} offset {:#x} not supported", addr, offset);
            return Err(MmError::Unsupported);
        }
        if len == 0 || flags.contains(MapFlags::SHARED) == flags.contains(MapFlags::PRIVATE) {
            return Err(MmError::InvalidArgument);
        }
        // 页面总是要从文件里读进来，所以文件必须可读；共享可写映射还要求文件可写
        if !file.readable() || (flags.contains(MapFlags::SHARED) && prot.contains(MapProt::WRITE) && !file.writable()) {
            warn!("[kernel] mmap: {:?} {:?} exceeds the file's access mode", prot, flags);
            return Err(MmError::PermissionDenied);
        }
        let slot = self
            .vmas
            .iter()
            .position(|vma| vma.is_none())
            .ok_or(MmError::NoVmaSlot)?;
        let len = len
            .checked_add(PAGE_SIZE - 1)
            .ok_or(MmError::NoAddressSpace(len))?
            & !(PAGE_SIZE - 1);
        let start = self.alloc_addr(len)?;
        let vma = Vma::new(
            VirtAddr(start).floor(),
            VirtAddr(start + len).floor(),
            prot,
            flags,
            file,
        );
        debug!("[kernel] create vma [{:#x}, {:#x}) in slot {}", start, start + len, slot);
        self.vmas[slot] = Some(vma);
        Ok(start)
    }

    /// First gap at or above `MMAP_MIN_ADDR` that fits `len` bytes, trying
    /// the end of each mapping in address order.
    fn alloc_addr(&self, len: usize) -> Result<usize> {
        let mut sorted: Vec<(usize, usize)> = self.vmas().map(|vma| (vma.start().0, vma.end().0)).collect();
        sorted.sort_unstable();
        // 从最低地址开始，依次跳过与已有映射重叠的部分
        let mut new_addr = MMAP_MIN_ADDR;
        for (start, end) in sorted {
            if start - new_addr >= len {
                break;
            }
            new_addr = new_addr.max(end);
        }
        if len > MMAP_MAX_ADDR - new_addr {
            return Err(MmError::NoAddressSpace(len));
        }
        Ok(new_addr)
    }

    /// Populate the page holding `va` from its file.
    ///
    /// A page that is already resident is left alone. If the page table
    /// cannot take the mapping the new frame goes straight back to the
    /// allocator.
    pub fn fault(&mut self, va: VirtAddr) -> Result<()> {
        let vpn = va.floor();
        let vma = self
            .vmas
            .iter_mut()
            .flatten()
            .find(|vma| vma.contains(vpn))
            .ok_or(MmError::BadAddress(va.0))?;
        if vma.data_frames.contains_key(&vpn) {
            return Ok(());
        }
        let frame = frame_alloc(&self.frame_allocator)?;
        let offset = vma.file_offset(vpn);
        let size = vma.file.size();
        if offset < size {
            // 跨过文件末尾的页只读入文件剩下的部分，其余保持为 0
            let len = (size - offset).min(PAGE_SIZE);
            let read = vma.file.read_at(offset, &mut frame.ppn.get_bytes_array()[..len])?;
            // 读不满一页按 I/O 失败处理，frame 随之归还
            if read != len {
                return Err(MmError::ShortIo { offset: offset + read });
            }
        }
        self.page_table.map(vpn, frame.ppn, vma.pte_flags())?;
        trace!("[kernel] fault in {:?} -> {:?}", vpn, frame.ppn);
        vma.data_frames.insert(vpn, frame);
        Ok(())
    }

    /// Resolve a trap for an access the page table refused: the access must
    /// be one the owning mapping allows, then the page is faulted in.
    pub fn handle_page_fault(&mut self, va: VirtAddr, write: bool) -> Result<()> {
        let vma = self.find_vma(va).ok_or(MmError::BadAddress(va.0))?;
        let allowed = if write {
            vma.prot.contains(MapProt::WRITE)
        } else {
            vma.prot.intersects(MapProt::READ | MapProt::WRITE)
        };
        if !allowed {
            return Err(MmError::PermissionDenied);
        }
        self.fault(va)
    }

    /// Remove `[addr, addr + len)` from the mapping that holds `addr`.
    ///
    /// `addr` must be page-aligned and `len` is rounded up to whole pages.
    /// The range has to be a prefix or a suffix of one mapping; a hole in
    /// the middle is refused. Dirty pages of a shared mapping are written
    /// back first, and if any of that fails nothing is unmapped.
    pub fn munmap(&mut self, addr: usize, len: usize) -> Result<()> {
        let start = VirtAddr(addr);
        if !start.aligned() || len == 0 {
            return Err(MmError::InvalidArgument);
        }
        let end = addr.checked_add(len).ok_or(MmError::InvalidArgument)?;
        let (start_vpn, end_vpn) = (start.floor(), VirtAddr(end).ceil());
        let slot = self
            .vmas
            .iter()
            .position(|vma| vma.as_ref().map_or(false, |vma| vma.contains(start_vpn)))
            .ok_or(MmError::BadAddress(addr))?;
        let page_table = &mut self.page_table;
        let vma = self.vmas[slot].as_mut().ok_or(MmError::BadAddress(addr))?;
        let (vma_start, vma_end) = (vma.vpn_range.get_start(), vma.vpn_range.get_end());
        if end_vpn > vma_end {
            return Err(MmError::InvalidArgument);
        }
        let prefix = start_vpn == vma_start;
        if !prefix && end_vpn != vma_end {
            warn!("[kernel] munmap [{:#x}, {:#x}) would split a vma", addr, end);
            return Err(MmError::Split);
        }
        let range = VPNRange::new(start_vpn, end_vpn);
        // 先全部写回，成功后才动页表，保证失败时映射原封不动
        if let Err(e) = vma.write_back(page_table, range) {
            error!("[kernel] munmap: write-back failed: {}", e);
            return Err(e);
        }
        vma.unmap_range(page_table, range);
        vma.vpn_range = if prefix {
            VPNRange::new(end_vpn, vma_end)
        } else {
            VPNRange::new(vma_start, start_vpn)
        };
        if vma.vpn_range.is_empty() {
            debug!("[kernel] free vma in slot {}", slot);
            self.vmas[slot] = None;
        }
        Ok(())
    }

    // 复制一个地址空间：只复制 VMA 表和文件引用，不复制页帧，子进程访问时再缺页读入
    ///Clone the mappings of `user_space`, with nothing resident
    pub fn from_existed_user(user_space: &Self) -> Result<Self> {
        let mut memory_set = Self::new_bare(&user_space.frame_allocator)?;
        for (dst, src) in memory_set.vmas.iter_mut().zip(user_space.vmas.iter()) {
            *dst = src.as_ref().map(Vma::from_another);
        }
        Ok(memory_set)
    }

    /// Unmap every mapping, writing dirty shared pages back. Used at exit,
    /// when there is nobody left to report a failed write-back to.
    pub fn recycle_data_pages(&mut self) {
        let page_table = &mut self.page_table;
        for slot in self.vmas.iter_mut() {
            if let Some(mut vma) = slot.take() {
                let range = vma.vpn_range;
                if let Err(e) = vma.write_back(page_table, range) {
                    error!("[kernel] exit: write-back of [{:?}, {:?}) lost: {}", vma.start(), vma.end(), e);
                }
                vma.unmap_range(page_table, range);
            }
        }
    }

    /// Load `buf.len()` bytes from user address `va`, faulting pages in as
    /// the MMU would.
    pub fn user_load(&mut self, va: usize, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let cur = VirtAddr(va + done);
            let ppn = self.touch(cur, false)?;
            let off = cur.page_offset();
            let n = (PAGE_SIZE - off).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&ppn.get_bytes_array()[off..off + n]);
            done += n;
        }
        Ok(())
    }

    /// Store `buf` at user address `va`, marking the pages dirty
    pub fn user_store(&mut self, va: usize, buf: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let cur = VirtAddr(va + done);
            let ppn = self.touch(cur, true)?;
            let off = cur.page_offset();
            let n = (PAGE_SIZE - off).min(buf.len() - done);
            ppn.get_bytes_array()[off..off + n].copy_from_slice(&buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    // 模拟 MMU 的一次访存：页表项缺失就走缺页处理，然后检查权限并设置 A/D 位
    fn touch(&mut self, va: VirtAddr, write: bool) -> Result<PhysPageNum> {
        let vpn = va.floor();
        let mapped = self.page_table.translate(vpn).map_or(false, |pte| pte.is_valid());
        if !mapped {
            self.handle_page_fault(va, write)?;
        }
        let pte = self
            .page_table
            .find_pte(vpn)
            .filter(|pte| pte.is_valid())
            .ok_or(MmError::BadAddress(va.0))?;
        if !pte.readable() || (write && !pte.writable()) {
            return Err(MmError::PermissionDenied);
        }
        pte.set_flags(if write { PTEFlags::A | PTEFlags::D } else { PTEFlags::A });
        Ok(pte.ppn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FsError;
    use crate::test_util::TestEnv;
    use alloc::vec;
    use bcache::CacheError;

    const RO: (bool, bool) = (true, false);
    const RW: (bool, bool) = (true, true);

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn ten_byte_file_faults_in_one_zero_padded_page() {
        let env = TestEnv::new(16);
        let file = env.open(&env.inode(b"0123456789", 1), RO);
        let mut ms = MemorySet::new_bare(&env.frames).unwrap();
        let free = env.frames.free_frames();
        let base = ms.mmap(0, 4096, MapProt::READ, MapFlags::SHARED, file, 0).unwrap();
        assert_eq!(base, MMAP_MIN_ADDR);
        // nothing populated at map time
        assert_eq!(env.frames.free_frames(), free);
        assert!(ms.translate(VirtAddr(base).floor()).is_none());

        ms.fault(VirtAddr(base)).unwrap();
        let pte = ms.translate(VirtAddr(base).floor()).unwrap();
        assert!(pte.is_valid() && pte.readable() && !pte.writable());
        assert!(pte.flags().contains(PTEFlags::U));
        let page = pte.ppn().get_bytes_array();
        assert_eq!(&page[..10], b"0123456789");
        assert!(page[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn faulted_pages_match_the_file() {
        let env = TestEnv::new(16);
        let data = content(6000);
        let file = env.open(&env.inode(&data, 6), RO);
        let mut ms = MemorySet::new_bare(&env.frames).unwrap();
        let base = ms.mmap(0, 8192, MapProt::READ, MapFlags::PRIVATE, file, 0).unwrap();
        ms.fault(VirtAddr(base + PAGE_SIZE + 123)).unwrap();
        // a second fault on the same page changes nothing
        ms.fault(VirtAddr(base + PAGE_SIZE)).unwrap();
        assert_eq!(ms.find_vma(VirtAddr(base)).unwrap().resident(), 1);
        let page = ms.translate(VirtAddr(base + PAGE_SIZE).floor()).unwrap().ppn().get_bytes_array();
        assert_eq!(&page[..6000 - PAGE_SIZE], &data[PAGE_SIZE..]);
        assert!(page[6000 - PAGE_SIZE..].iter().all(|&b| b == 0));

        let mut buf = vec![0u8; 5000];
        ms.user_load(base + 1000, &mut buf).unwrap();
        assert_eq!(&buf[..], &data[1000..6000]);
    }

    #[test]
    fn fault_outside_every_mapping_fails() {
        let env = TestEnv::new(8);
        let mut ms = MemorySet::new_bare(&env.frames).unwrap();
        assert_eq!(ms.fault(VirtAddr(MMAP_MIN_ADDR)), Err(MmError::BadAddress(MMAP_MIN_ADDR)));
        let file = env.open(&env.inode(b"abc", 1), RO);
        let base = ms.mmap(0, 10, MapProt::READ, MapFlags::SHARED, file, 0).unwrap();
        assert!(ms.fault(VirtAddr(base + PAGE_SIZE)).is_err());
    }

    /// Claims 100 bytes but hands back only the first 10
    struct Truncated;

    impl File for Truncated {
        fn readable(&self) -> bool {
            true
        }
        fn writable(&self) -> bool {
            false
        }
        fn size(&self) -> usize {
            100
        }
        fn read_at(&self, _offset: usize, buf: &mut [u8]) -> core::result::Result<usize, FsError> {
            buf[..10].fill(0xee);
            Ok(10)
        }
        fn write_at(&self, _offset: usize, _buf: &[u8]) -> core::result::Result<usize, FsError> {
            Err(FsError::NotWritable)
        }
    }

    #[test]
    fn short_read_fails_the_fault() {
        let env = TestEnv::new(8);
        let mut ms = MemorySet::new_bare(&env.frames).unwrap();
        let base = ms.mmap(0, 100, MapProt::READ, MapFlags::PRIVATE, Arc::new(Truncated), 0).unwrap();
        let free = env.frames.free_frames();
        assert_eq!(ms.fault(VirtAddr(base)), Err(MmError::ShortIo { offset: 10 }));
        // nothing installed, the frame went back
        assert!(ms.translate(VirtAddr(base).floor()).map_or(true, |pte| !pte.is_valid()));
        assert_eq!(ms.find_vma(VirtAddr(base)).unwrap().resident(), 0);
        assert_eq!(env.frames.free_frames(), free);
    }

    #[test]
    fn mmap_arguments_are_checked() {
        let env = TestEnv::new(8);
        let inode = env.inode(b"abc", 1);
        let ro = env.open(&inode, RO);
        let mut ms = MemorySet::new_bare(&env.frames).unwrap();
        let (r, rw) = (MapProt::READ, MapProt::READ | MapProt::WRITE);
        assert_eq!(ms.mmap(0x1000, 10, r, MapFlags::SHARED, ro.clone(), 0), Err(MmError::Unsupported));
        assert_eq!(ms.mmap(0, 10, r, MapFlags::SHARED, ro.clone(), 4096), Err(MmError::Unsupported));
        assert_eq!(ms.mmap(0, 0, r, MapFlags::SHARED, ro.clone(), 0), Err(MmError::InvalidArgument));
        assert_eq!(
            ms.mmap(0, 10, r, MapFlags::SHARED | MapFlags::PRIVATE, ro.clone(), 0),
            Err(MmError::InvalidArgument)
        );
        assert_eq!(ms.mmap(0, 10, rw, MapFlags::SHARED, ro.clone(), 0), Err(MmError::PermissionDenied));
        let wo = env.open(&inode, (false, true));
        assert_eq!(ms.mmap(0, 10, r, MapFlags::SHARED, wo, 0), Err(MmError::PermissionDenied));
        // private writes never reach the file
        assert!(ms.mmap(0, 10, rw, MapFlags::PRIVATE, ro, 0).is_ok());
        assert_eq!(ms.vmas().count(), 1);
    }

    #[test]
    fn every_slot_taken_fails_the_next_mmap() {
        let env = TestEnv::new(8);
        let file = env.open(&env.inode(b"abc", 1), RO);
        let mut ms = MemorySet::new_bare(&env.frames).unwrap();
        for _ in 0..NVMA {
            ms.mmap(0, 10, MapProt::READ, MapFlags::SHARED, file.clone(), 0).unwrap();
        }
        assert_eq!(
            ms.mmap(0, 10, MapProt::READ, MapFlags::SHARED, file, 0),
            Err(MmError::NoVmaSlot)
        );
    }

    #[test]
    fn mappings_never_overlap_and_gaps_are_reused() {
        let env = TestEnv::new(8);
        let file = env.open(&env.inode(b"abc", 1), RO);
        let mut ms = MemorySet::new_bare(&env.frames).unwrap();
        let mut bases = Vec::new();
        for pages in [1usize, 3, 2, 5] {
            let len = pages * PAGE_SIZE - 7;
            bases.push(ms.mmap(0, len, MapProt::READ, MapFlags::SHARED, file.clone(), 0).unwrap());
        }
        assert_eq!(bases, [MMAP_MIN_ADDR, MMAP_MIN_ADDR + 0x1000, MMAP_MIN_ADDR + 0x4000, MMAP_MIN_ADDR + 0x6000]);
        // free the three-page area; a two-page request lands in the hole
        ms.munmap(bases[1], 3 * PAGE_SIZE).unwrap();
        let reused = ms.mmap(0, 2 * PAGE_SIZE, MapProt::READ, MapFlags::SHARED, file.clone(), 0).unwrap();
        assert_eq!(reused, bases[1]);
        // four pages do not fit in what is left of it
        let after = ms.mmap(0, 4 * PAGE_SIZE, MapProt::READ, MapFlags::SHARED, file, 0).unwrap();
        assert_eq!(after, MMAP_MIN_ADDR + 0xb000);

        let ranges: Vec<_> = ms.vmas().map(|v| (v.start().0, v.end().0)).collect();
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                assert!(a.1 <= b.0 || b.1 <= a.0, "{:x?} overlaps {:x?}", a, b);
            }
        }
    }

    #[test]
    fn shared_store_is_written_back_on_unmap() {
        let env = TestEnv::new(16);
        let data = content(5000);
        let inode = env.inode(&data, 5);
        let file = env.open(&inode, RW);
        let mut ms = MemorySet::new_bare(&env.frames).unwrap();
        let free = env.frames.free_frames();
        let base = ms
            .mmap(0, 5000, MapProt::READ | MapProt::WRITE, MapFlags::SHARED, file, 0)
            .unwrap();
        // a full page goes out as more than one bounded write
        let page = vec![0xabu8; PAGE_SIZE];
        ms.user_store(base, &page).unwrap();
        ms.user_store(base + 4990, b"tail!").unwrap();
        assert!(ms.translate(VirtAddr(base).floor()).unwrap().is_dirty());
        ms.munmap(base, 5000).unwrap();
        assert_eq!(ms.vmas().count(), 0);
        // the root page table node frames are all that is left
        assert_eq!(env.frames.free_frames() + ms.page_table.node_frames() - 1, free);

        let disk = env.disk_bytes(&inode, 0, 5000);
        assert!(disk[..PAGE_SIZE].iter().all(|&b| b == 0xab));
        assert_eq!(&disk[PAGE_SIZE..4990], &data[PAGE_SIZE..4990]);
        assert_eq!(&disk[4990..4995], b"tail!");
        assert_eq!(&disk[4995..], &data[4995..]);
        assert_eq!(inode.size(), 5000);
    }

    #[test]
    fn private_store_never_reaches_the_file() {
        let env = TestEnv::new(16);
        let inode = env.inode(b"original", 1);
        let file = env.open(&inode, RW);
        let mut ms = MemorySet::new_bare(&env.frames).unwrap();
        let base = ms
            .mmap(0, 8, MapProt::READ | MapProt::WRITE, MapFlags::PRIVATE, file, 0)
            .unwrap();
        ms.user_store(base, b"modified").unwrap();
        let mut buf = [0u8; 8];
        ms.user_load(base, &mut buf).unwrap();
        assert_eq!(&buf, b"modified");
        let writes = env.disk.writes();
        ms.munmap(base, PAGE_SIZE).unwrap();
        assert_eq!(env.disk.writes(), writes);
        assert_eq!(env.disk_bytes(&inode, 0, 8), b"original");
    }

    #[test]
    fn clean_shared_pages_are_not_written() {
        let env = TestEnv::new(16);
        let inode = env.inode(b"clean", 1);
        let mut ms = MemorySet::new_bare(&env.frames).unwrap();
        let base = ms
            .mmap(0, 5, MapProt::READ | MapProt::WRITE, MapFlags::SHARED, env.open(&inode, RW), 0)
            .unwrap();
        let mut buf = [0u8; 5];
        ms.user_load(base, &mut buf).unwrap();
        let writes = env.disk.writes();
        ms.munmap(base, 5).unwrap();
        assert_eq!(env.disk.writes(), writes);
    }

    #[test]
    fn store_needs_write_permission() {
        let env = TestEnv::new(16);
        let file = env.open(&env.inode(b"abc", 1), RW);
        let mut ms = MemorySet::new_bare(&env.frames).unwrap();
        let base = ms.mmap(0, 3, MapProt::READ, MapFlags::SHARED, file, 0).unwrap();
        // no page to fault yet: refused before anything is allocated
        assert_eq!(ms.user_store(base, b"x"), Err(MmError::PermissionDenied));
        assert!(ms.translate(VirtAddr(base).floor()).is_none());
        // once resident, the page table itself refuses
        let mut buf = [0u8; 3];
        ms.user_load(base, &mut buf).unwrap();
        assert_eq!(ms.user_store(base, b"x"), Err(MmError::PermissionDenied));
        assert!(!ms.translate(VirtAddr(base).floor()).unwrap().is_dirty());
    }

    #[test]
    fn unmap_prefix_and_suffix_then_free() {
        let env = TestEnv::new(16);
        let data = content(4 * PAGE_SIZE);
        let file = env.open(&env.inode(&data, 16), RO);
        let mut ms = MemorySet::new_bare(&env.frames).unwrap();
        let base = ms.mmap(0, 4 * PAGE_SIZE, MapProt::READ, MapFlags::SHARED, file, 0).unwrap();
        let mut buf = vec![0u8; 4 * PAGE_SIZE];
        ms.user_load(base, &mut buf).unwrap();
        assert_eq!(ms.find_vma(VirtAddr(base)).unwrap().resident(), 4);

        // a hole is refused and changes nothing
        assert_eq!(ms.munmap(base + PAGE_SIZE, PAGE_SIZE), Err(MmError::Split));
        assert_eq!(ms.munmap(base + 1, PAGE_SIZE), Err(MmError::InvalidArgument));
        assert_eq!(ms.munmap(base, 5 * PAGE_SIZE), Err(MmError::InvalidArgument));
        assert_eq!(ms.find_vma(VirtAddr(base)).unwrap().resident(), 4);

        ms.munmap(base, PAGE_SIZE).unwrap();
        let vma = ms.find_vma(VirtAddr(base + PAGE_SIZE)).unwrap();
        assert_eq!((vma.start().0, vma.end().0), (base + PAGE_SIZE, base + 4 * PAGE_SIZE));
        assert!(ms.find_vma(VirtAddr(base)).is_none());
        assert!(!ms.translate(VirtAddr(base).floor()).unwrap().is_valid());

        ms.munmap(base + 3 * PAGE_SIZE, 10).unwrap();
        let vma = ms.find_vma(VirtAddr(base + PAGE_SIZE)).unwrap();
        assert_eq!(vma.end().0, base + 3 * PAGE_SIZE);
        assert_eq!(vma.resident(), 2);

        // offsets still count from the original base after losing the prefix
        let mut b = [0u8; 4];
        ms.user_load(base + 2 * PAGE_SIZE - 2, &mut b).unwrap();
        assert_eq!(&b, &data[2 * PAGE_SIZE - 2..2 * PAGE_SIZE + 2]);

        ms.munmap(base + PAGE_SIZE, 2 * PAGE_SIZE).unwrap();
        assert_eq!(ms.vmas().count(), 0);
        assert_eq!(ms.munmap(base + PAGE_SIZE, PAGE_SIZE), Err(MmError::BadAddress(base + PAGE_SIZE)));
    }

    #[test]
    fn failed_write_back_keeps_the_mapping() {
        let env = TestEnv::new(16);
        let inode = env.inode(&content(100), 1);
        let mut ms = MemorySet::new_bare(&env.frames).unwrap();
        let base = ms
            .mmap(0, 100, MapProt::READ | MapProt::WRITE, MapFlags::SHARED, env.open(&inode, RW), 0)
            .unwrap();
        ms.user_store(base, b"dirty").unwrap();
        let free = env.frames.free_frames();

        env.disk.set_read_only(true);
        let err = ms.munmap(base, PAGE_SIZE).unwrap_err();
        assert!(matches!(err, MmError::Fs(FsError::Cache(CacheError::Io { .. }))), "{:?}", err);
        let vma = ms.find_vma(VirtAddr(base)).unwrap();
        assert_eq!(vma.resident(), 1);
        assert!(ms.translate(VirtAddr(base).floor()).unwrap().is_dirty());
        assert_eq!(env.frames.free_frames(), free);
        // 写失败的块不会以新内容留在缓存里
        let mut head = [0u8; 5];
        inode.read_at(0, &mut head).unwrap();
        assert_eq!(&head[..], &content(100)[..5]);

        env.disk.set_read_only(false);
        ms.munmap(base, PAGE_SIZE).unwrap();
        assert_eq!(env.disk_bytes(&inode, 0, 5), b"dirty");
        assert_eq!(env.frames.free_frames(), free + 1);
    }

    #[test]
    fn page_table_exhaustion_frees_the_data_frame() {
        // one frame for the root and one for data: no room for interior nodes
        let env = TestEnv::new(2);
        let file = env.open(&env.inode(b"abc", 1), RO);
        let mut ms = MemorySet::new_bare(&env.frames).unwrap();
        let base = ms.mmap(0, 3, MapProt::READ, MapFlags::SHARED, file, 0).unwrap();
        assert_eq!(env.frames.free_frames(), 1);
        assert_eq!(ms.fault(VirtAddr(base)), Err(MmError::OutOfFrames));
        assert_eq!(env.frames.free_frames(), 1);
        assert_eq!(ms.find_vma(VirtAddr(base)).unwrap().resident(), 0);
    }

    #[test]
    fn child_inherits_mappings_and_faults_lazily() {
        let env = TestEnv::new(16);
        let inode = env.inode(b"from the file", 1);
        let mut parent = MemorySet::new_bare(&env.frames).unwrap();
        let base = parent
            .mmap(0, 13, MapProt::READ | MapProt::WRITE, MapFlags::PRIVATE, env.open(&inode, RO), 0)
            .unwrap();
        parent.user_store(base, b"FROM").unwrap();

        let mut child = MemorySet::from_existed_user(&parent).unwrap();
        assert_eq!(child.vmas().count(), 1);
        assert_eq!(child.find_vma(VirtAddr(base)).unwrap().resident(), 0);
        assert!(child.translate(VirtAddr(base).floor()).is_none());
        let mut buf = [0u8; 13];
        child.user_load(base, &mut buf).unwrap();
        assert_eq!(&buf, b"from the file");
        parent.user_load(base, &mut buf).unwrap();
        assert_eq!(&buf, b"FROM the file");
    }

    #[test]
    fn exit_writes_back_and_frees_every_frame() {
        let env = TestEnv::new(16);
        let inode = env.inode(&content(2 * PAGE_SIZE), 8);
        let free = env.frames.free_frames();
        let mut ms = MemorySet::new_bare(&env.frames).unwrap();
        let a = ms
            .mmap(0, 2 * PAGE_SIZE, MapProt::READ | MapProt::WRITE, MapFlags::SHARED, env.open(&inode, RW), 0)
            .unwrap();
        let b = ms
            .mmap(0, PAGE_SIZE, MapProt::READ, MapFlags::PRIVATE, env.open(&inode, RO), 0)
            .unwrap();
        ms.user_store(a + PAGE_SIZE, b"bye").unwrap();
        ms.user_load(b, &mut [0u8; 16]).unwrap();
        ms.recycle_data_pages();
        assert_eq!(ms.vmas().count(), 0);
        assert_eq!(env.disk_bytes(&inode, PAGE_SIZE, 3), b"bye");
        drop(ms);
        assert_eq!(env.frames.free_frames(), free);
    }
}
