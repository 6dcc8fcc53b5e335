//! 调度相关的外部协作者
//!
//! 块层本身不负责进程调度，只需要两样东西：
//! 区分执行单元的编号（用于锁持有者检查），以及睡眠/唤醒原语。

mod cpu;
mod wait;

pub use cpu::{CpuManager, push_off, pop_off};
pub use wait::WaitQueue;
