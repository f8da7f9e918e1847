//! Kernel memory management: a per-core physical frame allocator and
//! demand-paged file mappings on top of the `bcache` block cache.
//!
//! There are no globals. The frame allocator, block cache and every
//! process's memory set are built by the kernel at boot and passed by
//! reference; the current core comes from a [`sync::Hart`].
//!
//! - [`mm`]: frames, SV39 page tables, `mmap`/`munmap` and faults
//! - [`fs`]: the [`fs::File`] trait and cache-backed inodes
//! - [`task`], [`syscall`], [`trap`]: the process-facing glue

#![no_std]

extern crate alloc;
#[macro_use]
extern crate bitflags;
#[cfg(test)]
extern crate std;

pub mod config;
pub mod fs;
pub mod mm;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod trap;

#[cfg(test)]
mod test_util;
