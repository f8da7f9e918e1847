//!Implementation of [`TaskControlBlock`]
use crate::fs::File;
use crate::mm::{FrameAllocator, MemorySet, MmError};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use log::debug;
use spin::{Mutex, MutexGuard};

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum TaskStatus {
    Ready,
    Zombie,
}

pub struct TaskControlBlock {
    // immutable
    pub pid: usize,
    // mutable
    inner: Mutex<TaskControlBlockInner>,
}

pub struct TaskControlBlockInner {
    pub task_status: TaskStatus,
    // 进程的地址空间，文件映射都记录在这里
    pub memory_set: MemorySet,
    pub fd_table: Vec<Option<Arc<dyn File>>>,
    pub parent: Option<Weak<TaskControlBlock>>,
    pub children: Vec<Arc<TaskControlBlock>>,
    pub exit_code: i32,
}

impl TaskControlBlockInner {
    /// Lowest free descriptor, growing the table when it is full
    pub fn alloc_fd(&mut self) -> usize {
        if let Some(fd) = (0..self.fd_table.len()).find(|fd| self.fd_table[*fd].is_none()) {
            fd
        } else {
            self.fd_table.push(None);
            self.fd_table.len() - 1
        }
    }
    pub fn is_zombie(&self) -> bool {
        self.task_status == TaskStatus::Zombie
    }
}

impl TaskControlBlock {
    pub fn inner_exclusive_access(&self) -> MutexGuard<'_, TaskControlBlockInner> {
        self.inner.lock()
    }
    /// A process with an empty address space and no open files
    pub fn new(pid: usize, frame_allocator: &Arc<FrameAllocator>) -> Result<Self, MmError> {
        Ok(Self {
            pid,
            inner: Mutex::new(TaskControlBlockInner {
                task_status: TaskStatus::Ready,
                memory_set: MemorySet::new_bare(frame_allocator)?,
                fd_table: Vec::new(),
                parent: None,
                children: Vec::new(),
                exit_code: 0,
            }),
        })
    }
    // 子进程继承父进程的映射（不复制页帧）和打开的文件
    pub fn fork(self: &Arc<Self>, pid: usize) -> Result<Arc<Self>, MmError> {
        // ---- access parent PCB exclusively
        let mut parent_inner = self.inner_exclusive_access();
        let memory_set = MemorySet::from_existed_user(&parent_inner.memory_set)?;
        let task_control_block = Arc::new(TaskControlBlock {
            pid,
            inner: Mutex::new(TaskControlBlockInner {
                task_status: TaskStatus::Ready,
                memory_set,
                fd_table: parent_inner.fd_table.clone(),
                parent: Some(Arc::downgrade(self)),
                children: Vec::new(),
                exit_code: 0,
            }),
        });
        // add child
        parent_inner.children.push(Arc::clone(&task_control_block));
        debug!("[kernel] fork {} -> {}", self.pid, pid);
        Ok(task_control_block)
    }
    /// Tear down the process's mappings and files, leaving a zombie for
    /// the parent to collect.
    pub fn exit(&self, exit_code: i32) {
        let mut inner = self.inner_exclusive_access();
        inner.task_status = TaskStatus::Zombie;
        inner.exit_code = exit_code;
        // 先写回并释放所有映射页，再关闭文件
        inner.memory_set.recycle_data_pages();
        inner.fd_table.clear();
        debug!("[kernel] pid {} exited with {}", self.pid, exit_code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{MapFlags, MapProt, VirtAddr};
    use crate::test_util::TestEnv;

    #[test]
    fn fds_are_reused_lowest_first() {
        let env = TestEnv::new(4);
        let task = TaskControlBlock::new(1, &env.frames).unwrap();
        let file = env.open(&env.inode(b"x", 1), (true, false));
        let mut inner = task.inner_exclusive_access();
        for expect in 0..3 {
            let fd = inner.alloc_fd();
            assert_eq!(fd, expect);
            inner.fd_table[fd] = Some(file.clone());
        }
        inner.fd_table[1] = None;
        assert_eq!(inner.alloc_fd(), 1);
    }

    #[test]
    fn forked_child_shares_files_and_inherits_mappings() {
        let env = TestEnv::new(16);
        let parent = Arc::new(TaskControlBlock::new(1, &env.frames).unwrap());
        let inode = env.inode(b"shared bytes", 1);
        let file = env.open(&inode, (true, true));
        let base = {
            let mut inner = parent.inner_exclusive_access();
            inner.fd_table.push(Some(file.clone()));
            inner
                .memory_set
                .mmap(0, 12, MapProt::READ | MapProt::WRITE, MapFlags::SHARED, file.clone(), 0)
                .unwrap()
        };
        let child = parent.fork(2).unwrap();
        assert_eq!(parent.inner_exclusive_access().children.len(), 1);
        let parent_token = parent.inner_exclusive_access().memory_set.token();
        let mut inner = child.inner_exclusive_access();
        // 子进程有自己的页表
        assert_ne!(inner.memory_set.token(), parent_token);
        assert!(inner.fd_table[0].is_some());
        assert!(inner.memory_set.find_vma(VirtAddr(base)).is_some());
        inner.memory_set.user_store(base, b"SHARED").unwrap();
        drop(inner);
        child.exit(0);
        assert!(child.inner_exclusive_access().is_zombie());
        // the child's dirty page reached the file on exit
        assert_eq!(env.disk_bytes(&inode, 0, 12), b"SHARED bytes");
        // parent's file reference and the child's mapping reference are gone
        assert_eq!(Arc::strong_count(&file), 3);
    }
}
