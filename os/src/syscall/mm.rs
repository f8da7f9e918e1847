//! Memory-mapping syscalls
use crate::mm::{MapFlags, MapProt};
use crate::task::TaskControlBlock;
use log::warn;

/// 功能：把文件描述符 fd 对应的文件映射进当前进程的地址空间。
/// 返回值：成功时返回映射的起始地址，出错时返回 -1 。
/// syscall ID：222
pub fn sys_mmap(
    task: &TaskControlBlock,
    addr: usize,
    len: usize,
    prot: usize,
    flags: usize,
    fd: usize,
    offset: usize,
) -> isize {
    let (prot, flags) = match (
        MapProt::from_bits(prot as u32),
        MapFlags::from_bits(flags as u32),
    ) {
        (Some(prot), Some(flags)) => (prot, flags),
        _ => return -1,
    };
    let mut inner = task.inner_exclusive_access();
    let file = match inner.fd_table.get(fd) {
        Some(Some(file)) => file.clone(),
        _ => return -1,
    };
    match inner.memory_set.mmap(addr, len, prot, flags, file, offset) {
        Ok(base) => base as isize,
        Err(e) => {
            warn!("[kernel] pid {}: mmap failed: {}", task.pid, e);
            -1
        }
    }
}

/// 功能：解除 [addr, addr + len) 的映射，共享映射中被修改过的页先写回文件。
/// 返回值：成功返回 0，出错返回 -1 。
/// syscall ID：215
pub fn sys_munmap(task: &TaskControlBlock, addr: usize, len: usize) -> isize {
    let mut inner = task.inner_exclusive_access();
    match inner.memory_set.munmap(addr, len) {
        Ok(()) => 0,
        Err(e) => {
            warn!("[kernel] pid {}: munmap failed: {}", task.pid, e);
            -1
        }
    }
}
