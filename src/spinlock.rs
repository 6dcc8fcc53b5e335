//! 自旋锁模块
//! 自旋锁将数据包裹在自身内部以保护这些数据。

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, AtomicIsize, Ordering};

use crate::process::{CpuManager, pop_off, push_off};

/// 忙等待多少轮后主动让出执行单元
const SPINS_BEFORE_YIELD: u32 = 128;

/// 表示一个自旋锁结构，用于在多核环境下保护共享数据。
///
/// `SpinLock` 提供了互斥访问内部数据的能力，通过忙等待（busy-waiting）实现锁机制。
/// 当锁被占用时，尝试获取锁的执行单元将在循环中等待，直到锁被释放。
/// 该锁还跟踪持有锁的执行单元编号，用于调试和死锁检测。
///
/// 自旋锁只用于短临界区：持有期间不得睡眠，也不得进行设备 I/O。
///
/// # 类型参数
/// - `T`: 被保护的数据类型，可以是任意大小（`?Sized`）。
///
/// # 字段说明
/// - `lock`: 原子布尔值，表示锁的状态（`false`=未锁定，`true`=已锁定）；
/// - `name`: 锁的名称，用于调试和标识；
/// - `cpuid`: 当前持有锁的执行单元编号（-1表示无人持有）；
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    cpuid: AtomicIsize,
    data: UnsafeCell<T>,
}

// 为SpinLock实现Sync trait，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一个新的自旋锁实例。
    ///
    /// # 参数
    /// - `data`: 需要被保护的数据；
    /// - `name`: 锁的标识名称，用于调试。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            cpuid: AtomicIsize::new(-1),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取自旋锁并返回一个守卫对象。
    ///
    /// # 功能说明
    /// 通过忙等待获取锁的所有权，返回一个守卫对象。
    /// 守卫对象实现了`Deref`和`DerefMut`，允许直接访问被保护数据。
    /// 当守卫对象离开作用域时，自动释放锁。
    ///
    /// # 流程解释
    /// 1. 调用`push_off()`登记进入临界区；
    /// 2. 检查是否已持有锁（防止重入）；
    /// 3. 通过原子操作忙等待直到获取锁；
    /// 4. 设置内存屏障确保操作顺序；
    /// 5. 记录当前执行单元编号；
    /// 6. 返回守卫对象。
    ///
    /// # 示例
    /// ```ignore
    /// let lock = SpinLock::new(0, "test");
    /// {
    ///     let mut guard = lock.lock(); // 获取锁
    ///     *guard = 42; // 修改受保护数据
    /// } // 守卫离开作用域，自动释放锁
    /// ```
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 检查当前执行单元是否持有此锁。
    pub fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
            && self.cpuid.load(Ordering::Relaxed) == CpuManager::cpu_id() as isize
    }

    /// 获取锁的核心实现（内部方法）。
    ///
    /// # 注意
    /// 此方法不返回守卫对象，仅供内部使用。
    fn acquire(&self) {
        push_off();
        if self.holding() {
            panic!("spinlock {} acquire", self.name);
        }
        let mut spins = 0;
        while self.lock.compare_exchange(false, true,
            Ordering::Acquire, Ordering::Acquire).is_err() {
            spins += 1;
            if spins < SPINS_BEFORE_YIELD {
                hint::spin_loop();
            } else {
                // 宿主线程可能在持锁时被抢占，让出以免空转整个时间片
                spins = 0;
                std::thread::yield_now();
            }
        }
        fence(Ordering::SeqCst);
        self.cpuid.store(CpuManager::cpu_id() as isize, Ordering::Relaxed);
    }

    /// 释放锁的核心实现（内部方法）。
    ///
    /// # 流程解释
    /// 1. 验证当前执行单元确实持有锁；
    /// 2. 清除持有者记录；
    /// 3. 设置内存屏障确保操作顺序；
    /// 4. 原子存储`false`释放锁；
    /// 5. 调用`pop_off()`离开临界区。
    fn release(&self) {
        if !self.holding() {
            panic!("spinlock {} release", self.name);
        }
        self.cpuid.store(-1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
        pop_off();
    }
}

/// 自旋锁守卫对象，提供对受保护数据的访问。
///
/// 当守卫对象存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁，确保锁的释放。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    /// 当守卫离开作用域时自动释放锁。
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    /// 检查当前执行单元是否持有此锁，用于调试验证。
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

/// 从spin crate借鉴 (https://crates.io/crates/spin)
#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn smoke() {
        let m = SpinLock::new((), "smoke");
        m.lock();
        m.lock();
    }

    #[test]
    fn guard_tracks_holder() {
        let m = SpinLock::new(0u32, "holder");
        assert!(!m.holding());
        let guard = m.lock();
        assert!(guard.holding());
        drop(guard);
        assert!(!m.holding());
    }

    #[test]
    #[should_panic(expected = "spinlock reentry acquire")]
    fn reentrant_acquire_panics() {
        let m = SpinLock::new((), "reentry");
        let _a = m.lock();
        let _b = m.lock();
    }

    #[test]
    fn lots_and_lots() {
        const J: u32 = 1000;
        const K: u32 = 3;

        let m = SpinLock::new(0u32, "counter");
        thread::scope(|s| {
            for _ in 0..2 * K {
                s.spawn(|| {
                    for _ in 0..J {
                        *m.lock() += 1;
                    }
                });
            }
        });
        assert_eq!(*m.lock(), J * K * 2);
    }
}
