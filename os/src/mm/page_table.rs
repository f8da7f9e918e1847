//! Implementation of [`PageTableEntry`] and [`PageTable`].
use super::{frame_alloc, FrameAllocator, FrameTracker, MmError, PhysPageNum, VirtPageNum};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::*;

// V(Valid)：仅当位 V 为 1 时，页表项才是合法的；
// R(Read)/W(Write)/X(eXecute)：分别控制索引到这个页表项的对应虚拟页面是否允许读/写/执行；
// U(User)：控制索引到这个页表项的对应虚拟页面是否在 CPU 处于 U 特权级的情况下是否被允许访问；
// A(Accessed)/D(Dirty)：处理器记录自从该位被清零之后，对应虚拟页面是否被访问过/修改过
bitflags! {
    /// page table entry flags
    pub struct PTEFlags: u8 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

#[derive(Copy, Clone)]
#[repr(C)]
/// page table entry structure
pub struct PageTableEntry {
    pub bits: usize,
}

impl PageTableEntry {
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        PageTableEntry {
            bits: ppn.0 << 10 | flags.bits() as usize,
        }
    }
    pub fn empty() -> Self {
        PageTableEntry { bits: 0 }
    }
    pub fn ppn(&self) -> PhysPageNum {
        (self.bits >> 10 & ((1usize << 44) - 1)).into()
    }
    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits as u8)
    }
    pub fn is_valid(&self) -> bool {
        self.flags().contains(PTEFlags::V)
    }
    pub fn readable(&self) -> bool {
        self.flags().contains(PTEFlags::R)
    }
    pub fn writable(&self) -> bool {
        self.flags().contains(PTEFlags::W)
    }
    pub fn is_dirty(&self) -> bool {
        self.flags().contains(PTEFlags::D)
    }
    /// Set extra flag bits, as the MMU does with A and D
    pub fn set_flags(&mut self, flags: PTEFlags) {
        self.bits |= flags.bits() as usize;
    }
}

/// page table structure
pub struct PageTable {
    root_ppn: PhysPageNum,
    // frames 持有所有页表节点（包括根节点）所在的物理页帧，PageTable 被回收时它们也随之归还给分配器
    frames: Vec<FrameTracker>,
    allocator: Arc<FrameAllocator>,
}

impl PageTable {
    pub fn new(allocator: &Arc<FrameAllocator>) -> Result<Self, MmError> {
        let frame = frame_alloc(allocator)?;
        Ok(PageTable {
            root_ppn: frame.ppn,
            frames: vec![frame],
            allocator: Arc::clone(allocator),
        })
    }
    // 在多级页表找到一个虚拟页号对应的页表项的可变引用。如果在遍历的过程中发现有节点尚未创建则会新建一个节点
    fn find_pte_create(&mut self, vpn: VirtPageNum) -> Result<&mut PageTableEntry, MmError> {
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;
        for (i, idx) in idxs.iter().enumerate() {
            let pte = &mut ppn.get_pte_array()[*idx];
            if i == 2 {
                return Ok(pte);
            }
            if !pte.is_valid() {
                let frame = frame_alloc(&self.allocator)?;
                *pte = PageTableEntry::new(frame.ppn, PTEFlags::V);
                self.frames.push(frame);
            }
            ppn = pte.ppn();
        }
        unreachable!()
    }
    pub(crate) fn find_pte(&self, vpn: VirtPageNum) -> Option<&mut PageTableEntry> {
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;
        let mut result: Option<&mut PageTableEntry> = None;
        for (i, idx) in idxs.iter().enumerate() {
            let pte = &mut ppn.get_pte_array()[*idx];
            if i == 2 {
                result = Some(pte);
                break;
            }
            if !pte.is_valid() {
                return None;
            }
            ppn = pte.ppn();
        }
        result
    }
    /// Install `vpn -> ppn`. Fails only when an interior node frame cannot
    /// be allocated; nodes created before the failure stay for later use.
    pub fn map(&mut self, vpn: VirtPageNum, ppn: PhysPageNum, flags: PTEFlags) -> Result<(), MmError> {
        let pte = self.find_pte_create(vpn)?;
        assert!(!pte.is_valid(), "vpn {:?} is mapped before mapping", vpn);
        *pte = PageTableEntry::new(ppn, flags | PTEFlags::V);
        Ok(())
    }
    pub fn unmap(&mut self, vpn: VirtPageNum) {
        let pte = match self.find_pte(vpn) {
            Some(pte) if pte.is_valid() => pte,
            _ => panic!("vpn {:?} is invalid before unmapping", vpn),
        };
        *pte = PageTableEntry::empty();
    }
    /// Copy of the leaf entry for `vpn`, if the path to it exists
    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.find_pte(vpn).map(|pte| *pte)
    }
    pub fn token(&self) -> usize {
        8usize << 60 | self.root_ppn.0
    }
    /// Frames used by the table itself
    pub fn node_frames(&self) -> usize {
        self.frames.len()
    }
}
