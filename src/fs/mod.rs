//! 文件系统块存储层
//!
//! 自下而上：
//! - `bio`：带哈希桶的块缓存，同一时刻每个块在内存中至多一个副本；
//! - `log`：写前日志，把多个操作的更新打包成一个崩溃原子的事务；
//! - `superblock`：描述磁盘布局，挂载时据此定位日志区。

use ::log::info;

mod bio;
mod log;
mod superblock;

pub use bio::{Bcache, Buf, BufData, CacheStats};
pub use self::log::Log;
pub use superblock::SuperBlock;

/// 挂载设备上的文件系统，读取超级块并根据需要进行日志恢复
///
/// # 功能说明
/// 每个设备只应挂载一次，且在任何文件系统操作开始之前。
/// 返回的日志与块缓存绑定，之后所有对该设备的修改都应在
/// `begin_op`/`end_op` 之间通过 [`Log::write`] 进行。
///
/// # Panics
/// - 设备上没有有效的文件系统时触发panic
/// - 块缓存容纳不下一个满事务加一个日志块时触发panic
pub fn mount(bcache: &Bcache, dev: u32) -> Log<'_> {
    let sb = SuperBlock::read(bcache, dev);

    #[cfg(feature = "verbose_init_info")]
    info!("super block data: {:?}", sb);

    let log = Log::init(bcache, dev, &sb);
    info!("file system: setup done");

    #[cfg(feature = "verbose_init_info")]
    info!("file system: {} log blocks per transaction, {} cached buffers",
        log.capacity(), bcache.capacity());

    log
}

/// 在设备上创建空的文件系统布局
///
/// 写入超级块并清空日志头，其余块保持原样。
pub fn mkfs(bcache: &Bcache, dev: u32, sb: &SuperBlock) {
    sb.write(bcache, dev);
    let mut head = bcache.bread(dev, sb.logstart);
    head.fill(0);
    head.bwrite();
    info!("mkfs: dev {} size {} log {}@{}", dev, sb.size, sb.nlog, sb.logstart);
}
