//! 块设备驱动接口
//!
//! 块缓存通过 [`BlockDevice`] 访问底层设备。真正的磁盘驱动由内核提供，
//! 本模块只定义接口，并附带一个内存盘 [`ramdisk::RamDisk`]。

use crate::fs::BufData;

pub mod ramdisk;

pub use ramdisk::RamDisk;

/// 同步块设备。
///
/// 两个方法都在返回前完成整块传输。块缓存在调用期间持有对应缓冲块的睡眠锁，
/// 因此同一个缓冲块上不会出现重叠的 I/O。设备错误不在本层建模：
/// 实现要么成功，要么自行终止系统。
pub trait BlockDevice: Send + Sync {
    /// 将 `(dev, blockno)` 的内容读入 `data`。
    fn read_block(&self, dev: u32, blockno: u32, data: &mut BufData);

    /// 将 `data` 写入 `(dev, blockno)`。
    fn write_block(&self, dev: u32, blockno: u32, data: &BufData);
}
