//! File trait & cache-backed inodes

mod inode;

use bcache::CacheError;
use thiserror::Error;

pub use inode::{Extent, Inode, OSInode};

/// File-layer errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("file is not open for reading")]
    NotReadable,
    #[error("file is not open for writing")]
    NotWritable,
    /// A single write may not dirty more blocks than one transaction holds.
    #[error("write of {0} bytes exceeds the per-operation limit")]
    TooLarge(usize),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// File trait
///
/// Offsets are explicit: callers that need a cursor keep their own.
pub trait File: Send + Sync {
    /// If readable
    fn readable(&self) -> bool;
    /// If writable
    fn writable(&self) -> bool;
    /// Current size in bytes
    fn size(&self) -> usize;
    /// Read up to `buf.len()` bytes at `offset`; short only at end of file
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError>;
    /// Write `buf` at `offset`, growing the file; short only when the file is full
    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, FsError>;
}
