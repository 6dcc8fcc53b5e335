//! 睡眠锁模块
//! 提供基于睡眠/唤醒机制的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的执行单元会进入睡眠状态，避免忙等待。
//! 块缓存用它保护缓冲块内容，并在设备 I/O 期间一直持有。

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut, Drop};

use crate::process::{CpuManager, WaitQueue};
use crate::spinlock::SpinLock;

/// 睡眠锁结构，提供阻塞式同步机制
///
/// 与自旋锁不同，当锁被占用时，尝试获取的执行单元会进入睡眠状态，
/// 直到锁被释放后被唤醒。这避免了忙等待，适用于可能长时间持有的锁。
///
/// # 字段说明
/// - `lock`: 内部自旋锁，保护锁状态（是否占用、持有者）
/// - `wq`: 等待该锁的执行单元
/// - `name`: 锁的标识名称，用于调试
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<SleepState>,
    wq: WaitQueue,
    name: &'static str,
    data: UnsafeCell<T>,
}

/// 睡眠锁的占用状态，受内部自旋锁保护
struct SleepState {
    locked: bool,
    /// 持有者的执行单元编号，未占用时为 -1
    holder: isize,
}

// 为SleepLock实现Sync，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁实例
    ///
    /// # 参数
    /// - `data`: 需要被保护的数据
    /// - `name`: 锁的标识名称
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new(SleepState { locked: false, holder: -1 }, "sleeplock"),
            wq: WaitQueue::new("sleeplock.wq"),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞当前执行单元）
    ///
    /// # 流程解释
    /// 1. 获取内部自旋锁保护临界区
    /// 2. 检查`locked`状态：
    ///   - 如果已锁定：在等待队列上睡眠，醒来后重新加锁并再次检查
    ///   - 如果未锁定：设置`locked=true`并记录持有者
    /// 3. 释放内部自旋锁，返回守卫
    ///
    /// # 可能的错误
    /// - 当前执行单元已持有该锁时 panic（睡眠锁不可重入）
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let me = CpuManager::cpu_id() as isize;
        let mut guard = self.lock.lock();

        while guard.locked {
            if guard.holder == me {
                panic!("sleeplock {} acquire", self.name);
            }
            self.wq.sleep(guard);
            guard = self.lock.lock();
        }

        guard.locked = true;
        guard.holder = me;
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() }
        }
    }

    /// 检查当前执行单元是否持有该锁。
    pub fn holding(&self) -> bool {
        let guard = self.lock.lock();
        guard.locked && guard.holder == CpuManager::cpu_id() as isize
    }

    /// 释放锁（内部方法，由守卫的Drop调用）
    ///
    /// # 可能的错误
    /// - 当前执行单元不是持有者时 panic
    fn unlock(&self) {
        let mut guard = self.lock.lock();
        if !guard.locked || guard.holder != CpuManager::cpu_id() as isize {
            panic!("sleeplock {} release", self.name);
        }
        guard.locked = false;
        guard.holder = -1;
        self.wq.wakeup();
        drop(guard);
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 当守卫存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁。
/// 守卫必须在获取它的执行单元上释放，否则释放时 panic。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    /// 检查当前执行单元是否仍是该锁的持有者。
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    /// 标记锁为可用状态，并唤醒等待该锁的执行单元
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn exclusive_holder() {
        let lock = SleepLock::new(0u64, "excl");
        let inside = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..200 {
                        let mut guard = lock.lock();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        *guard += 1;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(*lock.lock(), 800);
    }

    #[test]
    fn waiter_blocks_until_release() {
        let lock = SleepLock::new(Vec::<u32>::new(), "order");
        thread::scope(|s| {
            let mut guard = lock.lock();
            let waiter = s.spawn(|| lock.lock().push(2));
            thread::sleep(Duration::from_millis(20));
            guard.push(1);
            drop(guard);
            waiter.join().unwrap();
        });
        assert_eq!(*lock.lock(), vec![1, 2]);
    }

    #[test]
    fn holding_reports_owner_only() {
        let lock = SleepLock::new((), "owner");
        let guard = lock.lock();
        assert!(guard.holding());
        thread::scope(|s| {
            s.spawn(|| assert!(!lock.holding()));
        });
        drop(guard);
        assert!(!lock.holding());
    }

    #[test]
    #[should_panic(expected = "sleeplock again acquire")]
    fn reacquire_by_holder() {
        let lock = SleepLock::new((), "again");
        let _g = lock.lock();
        let _h = lock.lock();
    }
}
