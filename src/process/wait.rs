//! 睡眠与唤醒

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use core::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};

use crate::spinlock::{SpinLock, SpinLockGuard};
use super::CpuManager;

/// 等待队列，充当内核中 `sleep(channel)`/`wakeup(channel)` 的“通道”。
///
/// 每个需要阻塞等待的对象（睡眠锁、日志）各自持有一个等待队列，
/// 而不是共用以地址区分的全局通道表。
///
/// 使用约定与 xv6 相同：
/// - 等待者在持有保护条件的自旋锁时检查条件，不满足则调用 [`WaitQueue::sleep`]，
///   该函数会先登记自己再释放锁，因此不会丢失唤醒；
/// - 被唤醒后需要重新获取锁并再次检查条件；
/// - 唤醒者先在锁内修改条件，再调用 [`WaitQueue::wakeup`]。
pub struct WaitQueue {
    sleepers: SpinLock<Vec<Arc<Sleeper>>>,
}

/// 一个处于睡眠状态的执行单元
struct Sleeper {
    thread: Thread,
    woken: AtomicBool,
}

impl WaitQueue {
    pub const fn new(name: &'static str) -> Self {
        Self {
            sleepers: SpinLock::new(Vec::new(), name),
        }
    }

    /// 原子地释放 `guard` 并让当前执行单元睡眠，直到被 [`WaitQueue::wakeup`] 唤醒。
    ///
    /// # 流程解释
    /// 1. 在等待队列中登记当前执行单元；
    /// 2. 释放调用者持有的自旋锁；
    /// 3. 检查当前不再持有任何自旋锁；
    /// 4. 挂起，直到唤醒标志被置位（伪唤醒会继续挂起）。
    ///
    /// 返回时调用者不持有任何锁，需要自行重新加锁并检查条件。
    ///
    /// # 可能的错误
    /// - 除 `guard` 外仍持有其他自旋锁时 panic（`"sleep: sched locks"`）。
    pub fn sleep<T: ?Sized>(&self, guard: SpinLockGuard<'_, T>) {
        let me = Arc::new(Sleeper {
            thread: thread::current(),
            woken: AtomicBool::new(false),
        });
        self.sleepers.lock().push(Arc::clone(&me));
        drop(guard);

        if CpuManager::noff() != 0 {
            panic!("sleep: sched locks");
        }
        while !me.woken.load(Ordering::Acquire) {
            thread::park();
        }
    }

    /// 唤醒所有在该队列上睡眠的执行单元。
    pub fn wakeup(&self) {
        let sleepers = mem::take(&mut *self.sleepers.lock());
        for s in sleepers {
            s.woken.store(true, Ordering::Release);
            s.thread.unpark();
        }
    }
}
