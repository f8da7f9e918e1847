//! Process state the memory subsystem works against
//!
//! A [`TaskControlBlock`] owns one [`MemorySet`](crate::mm::MemorySet) and
//! one file descriptor table; syscalls and traps reach both through
//! `inner_exclusive_access`.

// #[allow(clippy::module_inception)] 意味着允许发生 module_inception 这个 lint，而不会给出警告。
#[allow(clippy::module_inception)]
mod task;

pub use task::{TaskControlBlock, TaskControlBlockInner, TaskStatus};
