//! Page-fault handling
//!
//! The trap entry decodes `scause`/`stval` and, for the three page-fault
//! exceptions, calls [`user_page_fault()`]. A fault on a mapped file page
//! reads the page in and the application resumes at the faulting
//! instruction; any other fault kills the application.

use crate::mm::{MemorySet, MmError, VirtAddr};
use crate::task::TaskControlBlock;
use log::error;

/// page fault exit code
pub const PAGE_FAULT_EXIT_CODE: i32 = -2;

/// The page-fault flavours of `scause`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultCause {
    LoadPageFault,
    StorePageFault,
    InstructionPageFault,
}

/// Try to resolve a fault at `stval`; `Err` carries the exit code the
/// application must be killed with.
pub fn page_fault(memory_set: &mut MemorySet, cause: PageFaultCause, stval: usize) -> Result<(), i32> {
    let va = VirtAddr(stval);
    let result = match cause {
        PageFaultCause::LoadPageFault => memory_set.handle_page_fault(va, false),
        PageFaultCause::StorePageFault => memory_set.handle_page_fault(va, true),
        // 文件映射都不可执行
        PageFaultCause::InstructionPageFault => Err(MmError::PermissionDenied),
    };
    result.map_err(|e| {
        error!(
            "[kernel] {:?} in application, bad addr = {:#x} ({}), kernel killed it.",
            cause, stval, e
        );
        PAGE_FAULT_EXIT_CODE
    })
}

/// Handle a page fault taken by `task`, killing it if the fault is fatal
pub fn user_page_fault(task: &TaskControlBlock, cause: PageFaultCause, stval: usize) {
    let result = page_fault(&mut task.inner_exclusive_access().memory_set, cause, stval);
    if let Err(exit_code) = result {
        task.exit(exit_code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::mm::{MapFlags, MapProt};
    use crate::test_util::TestEnv;

    fn task_with_mapping(env: &TestEnv, prot: MapProt) -> (TaskControlBlock, usize) {
        let task = TaskControlBlock::new(7, &env.frames).unwrap();
        let file = env.open(&env.inode(b"page fault", 1), (true, true));
        let base = task
            .inner_exclusive_access()
            .memory_set
            .mmap(0, 10, prot, MapFlags::SHARED, file, 0)
            .unwrap();
        (task, base)
    }

    #[test]
    fn fault_on_mapped_page_resumes() {
        let env = TestEnv::new(16);
        let (task, base) = task_with_mapping(&env, MapProt::READ);
        user_page_fault(&task, PageFaultCause::LoadPageFault, base + 4);
        let inner = task.inner_exclusive_access();
        assert!(!inner.is_zombie());
        let pte = inner.memory_set.translate(VirtAddr(base).floor()).unwrap();
        assert_eq!(&pte.ppn().get_bytes_array()[..10], b"page fault");
    }

    #[test]
    fn stray_or_forbidden_access_kills() {
        let env = TestEnv::new(16);
        let (task, base) = task_with_mapping(&env, MapProt::READ);
        let mut inner = task.inner_exclusive_access();
        let ms = &mut inner.memory_set;
        assert_eq!(
            page_fault(ms, PageFaultCause::LoadPageFault, base + PAGE_SIZE),
            Err(PAGE_FAULT_EXIT_CODE)
        );
        assert_eq!(page_fault(ms, PageFaultCause::StorePageFault, base), Err(PAGE_FAULT_EXIT_CODE));
        assert_eq!(
            page_fault(ms, PageFaultCause::InstructionPageFault, base),
            Err(PAGE_FAULT_EXIT_CODE)
        );
        drop(inner);

        user_page_fault(&task, PageFaultCause::StorePageFault, 0x1000);
        let inner = task.inner_exclusive_access();
        assert!(inner.is_zombie());
        assert_eq!(inner.exit_code, PAGE_FAULT_EXIT_CODE);
        assert_eq!(inner.memory_set.vmas().count(), 0);
    }
}
