//! Implementation of syscalls
//!
//! The single entry point to all system calls, [`syscall()`], is called
//! whenever userspace wishes to perform a system call using the `ecall`
//! instruction. In this case, the processor raises an 'Environment call from
//! U-mode' exception, which is handled as one of the cases in the trap
//! handler.
//!
//! Only the memory-mapping calls live here; ids follow the Linux RISC-V
//! numbering.

const SYSCALL_MUNMAP: usize = 215;
const SYSCALL_MMAP: usize = 222;

mod mm;

use crate::task::TaskControlBlock;
use log::warn;
pub use mm::*;

/// handle syscall exception with `syscall_id` and other arguments
pub fn syscall(task: &TaskControlBlock, syscall_id: usize, args: [usize; 6]) -> isize {
    match syscall_id {
        SYSCALL_MUNMAP => sys_munmap(task, args[0], args[1]),
        SYSCALL_MMAP => sys_mmap(task, args[0], args[1], args[2], args[3], args[4], args[5]),
        _ => {
            warn!("[kernel] unsupported syscall_id: {}", syscall_id);
            -1
        }
    }
}
