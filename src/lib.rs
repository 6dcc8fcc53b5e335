//! 内核块存储层
//!
//! 包含带哈希桶的并发块缓存，以及支持并发操作、静默提交和崩溃恢复的写前日志。
//! 锁原语沿用内核的自旋锁/睡眠锁语义，执行单元由宿主线程充当。

#![warn(rust_2018_idioms)]

extern crate alloc;

pub mod consts;
pub mod driver;
pub mod fs;
pub mod process;
pub mod sleeplock;
pub mod spinlock;

pub use driver::{BlockDevice, RamDisk};
pub use fs::{mkfs, mount, Bcache, Buf, BufData, CacheStats, Log, SuperBlock};
