use super::BlockDeviceError;
use core::any::Any;
/// Trait for block devices
/// which reads and writes data in the unit of blocks
// 与缓存交互的设备必须可以在多个核之间共享（Send + Sync），读写都是同步的：返回时 I/O 已经完成
pub trait BlockDevice: Send + Sync + Any {
    ///Read data form block to buffer
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), BlockDeviceError>;
    ///Write data from buffer to block
    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), BlockDeviceError>;
}
