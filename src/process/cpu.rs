//! 执行单元（CPU）相关的状态
//!
//! 块层运行在宿主线程之上，每个线程被视为一个独立的执行单元：
//! 线程首次访问时分配一个唯一编号，用于锁的持有者检查；
//! 同时记录该线程当前持有的自旋锁层数，对应内核中 `push_off`/`pop_off` 的嵌套计数。

use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};

/// 下一个可分配的执行单元编号
static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CPU: Cpu = Cpu::new();
}

/// 单个执行单元的私有状态。
struct Cpu {
    /// 执行单元编号，进程内唯一
    id: usize,
    /// 当前持有的自旋锁层数
    noff: Cell<usize>,
}

impl Cpu {
    fn new() -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            noff: Cell::new(0),
        }
    }
}

/// 执行单元管理器，只提供关联函数。
pub struct CpuManager;

impl CpuManager {
    /// 返回当前执行单元的编号。
    #[inline]
    pub fn cpu_id() -> usize {
        CPU.with(|c| c.id)
    }

    /// 返回当前执行单元持有的自旋锁层数。
    #[inline]
    pub fn noff() -> usize {
        CPU.with(|c| c.noff.get())
    }
}

/// 进入自旋锁临界区，嵌套计数加一。
///
/// 与内核中的 `push_off` 对应；宿主环境没有中断可以关闭，
/// 这里只维护嵌套层数，供 [`super::WaitQueue::sleep`] 检查
/// “持有自旋锁时睡眠”这类错误用法。
pub fn push_off() {
    CPU.with(|c| c.noff.set(c.noff.get() + 1));
}

/// 离开自旋锁临界区，嵌套计数减一。
///
/// # 可能的错误
/// - 调用次数与 `push_off()` 不匹配时 panic。
pub fn pop_off() {
    CPU.with(|c| {
        let noff = c.noff.get();
        if noff == 0 {
            panic!("pop_off(): count not match");
        }
        c.noff.set(noff - 1);
    });
}
