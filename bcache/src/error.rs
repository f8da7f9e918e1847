use thiserror::Error;

/// Errors reported by a [`BlockDevice`](crate::BlockDevice)
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BlockDeviceError {
    #[error("block {0} is beyond the end of the device")]
    OutOfRange(usize),
    #[error("device is read-only")]
    ReadOnly,
    #[error("device I/O failed")]
    Failed,
}

/// Block cache errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    #[error("no such block device: {0}")]
    NoSuchDevice(usize),

    /// Every buffer is referenced, nothing can be recycled.
    #[error("no unreferenced buffer left to recycle")]
    NoBuffers,

    #[error("I/O error on device {dev}, block {blockno}: {source}")]
    Io {
        dev: usize,
        blockno: usize,
        #[source]
        source: BlockDeviceError,
    },
}

pub type Result<T> = core::result::Result<T, CacheError>;
