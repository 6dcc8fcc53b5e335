//! 缓存层
//!
//! 块缓存把磁盘块的副本保存在固定数量的缓冲块中，减少磁盘访问，
//! 同时为多个执行单元共同使用的磁盘块提供同步点。
//!
//! 接口：
//! * 调用 [`Bcache::bread`] 获取某个磁盘块的缓冲块；
//! * 修改数据后调用 [`Buf::bwrite`] 写回磁盘（或交给日志层）；
//! * 使用完毕后丢弃 [`Buf`]（或调用 [`Bcache::brelse`]）；
//! * 同一时刻只有一个执行单元可以使用某个缓冲块，不要长期持有。
//!
//! 缓冲块按 `(dev, blockno)` 的哈希值分布在 [`NBUCKET`] 个桶中，每个桶有自己的自旋锁，
//! 命中路径只锁一个桶；另有一把仲裁锁，只在为未缓存的块挑选替换对象时使用。

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use array_macro::array;
use log::trace;

use crate::consts::fs::{BSIZE, NBUCKET, NBUF};
use crate::driver::BlockDevice;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::{SpinLock, SpinLockGuard};

/// 计算 `(dev, blockno)` 所属的哈希桶。
#[inline]
fn bucket_key(dev: u32, blockno: u32) -> usize {
    (((dev << 27) | blockno) as usize) % NBUCKET
}

/// 缓冲区缓存（Buffer Cache）结构体，用于块设备的读写缓存。
///
/// `Bcache` 提供了一个固定大小的内存缓冲区池，用于缓存磁盘块数据。
/// 缓冲块在构造时一次性分配，之后只会在桶之间迁移、被重新指派给别的磁盘块，
/// 不会单独创建或释放。
///
/// 替换策略为“最久未释放优先”：每个缓冲块在引用计数归零时记录一个单调递增的时间戳，
/// 需要替换时选择引用计数为 0 且时间戳最小的缓冲块。
///
/// 该结构由内核显式构造，并以引用的形式交给日志层与文件系统使用。
pub struct Bcache {
    /// 底层块设备
    disk: Arc<dyn BlockDevice>,

    /// 仲裁锁。
    ///
    /// 只在准备接纳一个尚未缓存的块时持有，使“新块进入缓存”这一事件全局有序，
    /// 保证两个执行单元不会同时挑中同一个空闲缓冲块。
    atom: SpinLock<()>,

    /// 哈希桶，每个桶保存当前归属于它的缓冲块的控制信息。
    ///
    /// 桶锁同时保护其成员的引用计数与时间戳。
    buckets: [SpinLock<Bucket>; NBUCKET],

    /// 缓冲块数组，下标即缓冲块的稳定编号。
    bufs: Box<[BufInner]>,

    /// 释放时间戳计数器
    ticks: AtomicU64,

    stats: Stats,
}

impl Bcache {
    /// 构造一个含 `nbuf` 个缓冲块的块缓存。
    ///
    /// # 功能说明
    /// 分配全部缓冲块，并按编号轮流放入各个哈希桶。
    /// 初始时所有缓冲块都没有绑定磁盘块，引用计数为 0。
    ///
    /// # 可能的错误
    /// - `nbuf` 为 0 时 panic。
    pub fn new(disk: Arc<dyn BlockDevice>, nbuf: usize) -> Self {
        if nbuf == 0 {
            panic!("binit: empty buffer pool");
        }

        let bufs: Vec<BufInner> = (0..nbuf).map(|_| BufInner::new()).collect();
        let buckets = array![_ => SpinLock::new(Bucket::new(), "bcache.bucket"); NBUCKET];
        for index in 0..nbuf {
            buckets[index % NBUCKET].lock().ctrls.push(BufCtrl::new(index));
        }

        Self {
            disk,
            atom: SpinLock::new((), "bcache.atom"),
            buckets,
            bufs: bufs.into_boxed_slice(),
            ticks: AtomicU64::new(0),
            stats: Stats::new(),
        }
    }

    /// 使用默认缓冲块数量 [`NBUF`] 构造块缓存。
    pub fn with_default(disk: Arc<dyn BlockDevice>) -> Self {
        Self::new(disk, NBUF)
    }

    /// 缓冲块总数。
    pub fn capacity(&self) -> usize {
        self.bufs.len()
    }

    /// 获取指定设备与块号对应的缓冲块，返回时已持有其睡眠锁。
    ///
    /// # 功能说明
    /// `bget` 是缓冲区缓存系统的底层接口，用于查找是否已缓存给定的 `(dev, blockno)` 对应的块。
    /// 若缓存命中，则返回已存在的缓冲块；否则回收一个未被引用的块分配给新请求。
    /// 该函数不涉及实际磁盘读写，调用者需通过 `valid` 字段判断是否需要从磁盘加载数据。
    ///
    /// # 流程解释
    /// 1. 只锁住目标桶查找，命中则增加引用计数，解锁后等待睡眠锁；
    /// 2. 未命中则先释放桶锁（缩短持锁时间），获取仲裁锁后再查一次目标桶，
    ///    以覆盖两次加锁之间其他执行单元已缓存该块的情况；
    /// 3. 仍未命中：持有仲裁锁，按下标顺序逐个锁住每个桶，
    ///    在全局范围内寻找引用计数为 0 且释放时间戳最小的缓冲块；
    ///    一旦在别的桶找到更好的候选，立即释放先前候选所在桶的锁，
    ///    扫描结束时至多持有一个桶锁；
    /// 4. 若没有可用的缓冲块，触发 panic；
    /// 5. 若候选不在目标桶，将其从原桶摘下并挂入目标桶，设置块号、清除有效位、
    ///    引用计数置 1，释放所有自旋锁后再获取其睡眠锁。
    ///
    /// 固定的扫描顺序加上唯一的仲裁锁，使得同时进行的替换不会形成循环等待；
    /// 其余路径任何时刻至多持有一个桶锁。
    ///
    /// # 可能的错误
    /// - 所有缓冲块都处于被引用状态时 panic（`"bget: no buffers"`）。
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let key = bucket_key(dev, blockno);

        let mut bucket = self.buckets[key].lock();
        if let Some(index) = bucket.find_cached(dev, blockno) {
            drop(bucket);
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return self.lock_buf(index, dev, blockno);
        }
        drop(bucket);

        let atom = self.atom.lock();

        // 释放桶锁到获取仲裁锁之间，其他执行单元可能已经缓存了该块
        let mut bucket = self.buckets[key].lock();
        if let Some(index) = bucket.find_cached(dev, blockno) {
            drop(bucket);
            drop(atom);
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return self.lock_buf(index, dev, blockno);
        }
        drop(bucket);

        let mut victim: Option<Victim<'_>> = None;
        for (i, bucket) in self.buckets.iter().enumerate() {
            let guard = bucket.lock();
            let better = guard.lru_idle().filter(|&(_, lastuse)| {
                victim.as_ref().map_or(true, |v| lastuse < v.lastuse)
            });
            match better {
                // 旧候选的桶锁随旧值一起释放
                Some((pos, lastuse)) => victim = Some(Victim { key: i, pos, lastuse, guard }),
                None => drop(guard),
            }
        }

        let Victim { key: from, pos, mut guard, .. } = match victim {
            Some(v) => v,
            None => panic!("bget: no buffers"),
        };

        let ctrl = &mut guard.ctrls[pos];
        let index = ctrl.index;
        if let Some((old_dev, old_blockno)) = ctrl.block {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            trace!("bcache: evict {}:{} from buf {} for {}:{}", old_dev, old_blockno, index, dev, blockno);
        }
        ctrl.block = Some((dev, blockno));
        ctrl.refcnt = 1;
        self.bufs[index].valid.store(false, Ordering::Relaxed);

        if from != key {
            let ctrl = guard.ctrls.remove(pos);
            drop(guard);
            self.buckets[key].lock().ctrls.push(ctrl);
        } else {
            drop(guard);
        }
        drop(atom);

        self.lock_buf(index, dev, blockno)
    }

    fn lock_buf(&self, index: usize, dev: u32, blockno: u32) -> Buf<'_> {
        Buf {
            bcache: self,
            index,
            dev,
            blockno,
            data: Some(self.bufs[index].data.lock()),
        }
    }

    /// 从缓冲区缓存中读取指定设备与块号对应的数据。
    ///
    /// # 功能说明
    /// 该函数是对外提供的读取接口，用于从缓存中获取给定 `(dev, blockno)` 对应的缓冲块。
    /// 若缓冲块未被标记为有效（即未曾从磁盘加载），则会自动触发一次从磁盘读取操作。
    ///
    /// # 参数
    /// - `dev`: 设备号，标识请求的块所属的块设备；
    /// - `blockno`: 块号，标识请求的块在设备上的逻辑位置。
    ///
    /// # 返回值
    /// - 返回一个 `Buf` 对象，内部持有睡眠锁，数据保证有效。
    ///
    /// # 可能的错误
    /// - 若 `bget` 无法获取可用缓冲块（所有块都处于使用中），将触发 panic。
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut b = self.bget(dev, blockno);
        let valid = &self.bufs[b.index].valid;
        if !valid.load(Ordering::Relaxed) {
            let data = b.data.as_mut().unwrap();
            self.disk.read_block(dev, blockno, data);
            valid.store(true, Ordering::Relaxed);
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        b
    }

    /// 释放缓冲块。等价于丢弃 `buf`，只是让调用点更显眼。
    pub fn brelse(&self, buf: Buf<'_>) {
        debug_assert!(core::ptr::eq(buf.bcache, self));
        drop(buf);
    }

    /// 引用计数减一；归零时记录释放时间戳，此后该缓冲块可以被替换。
    fn release(&self, index: usize, dev: u32, blockno: u32) {
        let mut bucket = self.buckets[bucket_key(dev, blockno)].lock();
        let ctrl = bucket.ctrl_mut(index);
        ctrl.refcnt -= 1;
        if ctrl.refcnt == 0 {
            ctrl.lastuse = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        }
    }

    fn pin(&self, index: usize, dev: u32, blockno: u32) {
        let mut bucket = self.buckets[bucket_key(dev, blockno)].lock();
        bucket.ctrl_mut(index).refcnt += 1;
    }

    fn unpin(&self, index: usize, dev: u32, blockno: u32) {
        let mut bucket = self.buckets[bucket_key(dev, blockno)].lock();
        let ctrl = bucket.ctrl_mut(index);
        // 调用者手里的 Buf 本身占有一个引用
        if ctrl.refcnt <= 1 {
            panic!("buf unpin not match");
        }
        ctrl.refcnt -= 1;
    }

    /// 返回缓存命中、磁盘读取与替换次数的快照。
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }

    /// 当前绑定了磁盘块的缓冲块：`(dev, blockno, refcnt)`。
    ///
    /// 逐个锁住每个桶读取，结果只是近似快照，供诊断与测试使用。
    pub fn snapshot(&self) -> Vec<(u32, u32, usize)> {
        let mut out = Vec::new();
        for bucket in self.buckets.iter() {
            let guard = bucket.lock();
            out.extend(guard.ctrls.iter().filter_map(|c| {
                c.block.map(|(dev, blockno)| (dev, blockno, c.refcnt))
            }));
        }
        out
    }
}

/// 替换扫描过程中的当前最佳候选，持有其所在桶的锁。
struct Victim<'a> {
    key: usize,
    pos: usize,
    lastuse: u64,
    guard: SpinLockGuard<'a, Bucket>,
}

/// 块缓存的统计计数
struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
    evictions: AtomicUsize,
}

impl Stats {
    const fn new() -> Self {
        Self {
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
        }
    }
}

/// [`Bcache::stats`] 的返回值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// 查找命中的次数
    pub hits: usize,
    /// 从设备读入的次数
    pub misses: usize,
    /// 已绑定的缓冲块被改派给其他磁盘块的次数
    pub evictions: usize,
}

/// 缓冲块数据的包装结构，表示一个已分配的磁盘块缓存实体。
///
/// `Buf` 结构代表一个特定 `(dev, blockno)` 的缓冲区块，
/// 持有对其数据的独占访问权限（由 `SleepLockGuard` 保护），
/// 并在生命周期结束时自动释放睡眠锁并归还引用计数。
///
/// `Buf` 必须在获取它的执行单元上释放，否则释放时 panic。
pub struct Buf<'a> {
    bcache: &'a Bcache,

    /// 缓冲块在缓冲数组中的编号。
    index: usize,

    /// 缓冲块对应的设备编号。
    dev: u32,

    /// 缓冲块在设备中的逻辑块号。
    blockno: u32,

    /// 缓冲数据的睡眠锁保护访问器。
    ///
    /// 在 `Buf` 生命周期内保证始终为 `Some`，
    /// `Drop` 中先取出并释放它，再归还引用计数。
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a> Buf<'a> {
    pub fn read_blockno(&self) -> u32 {
        self.blockno
    }

    pub fn read_dev(&self) -> u32 {
        self.dev
    }

    /// 将缓冲块内容同步写回磁盘。
    ///
    /// # 可能的错误
    /// - 当前执行单元未持有该缓冲块的睡眠锁时 panic。
    pub fn bwrite(&mut self) {
        let data = self.data.as_ref().unwrap();
        if !data.holding() {
            panic!("bwrite");
        }
        self.bcache.disk.write_block(self.dev, self.blockno, data);
    }

    /// 将当前缓冲块的引用计数加一，表示“钉住”该块，防止其被回收。
    ///
    /// # 功能说明
    /// 在缓冲块被释放之后，如果希望确保该块在某段时间内不被替换（例如等待日志提交），
    /// 应调用 `pin` 将其引用计数加一。不涉及睡眠锁，需与 `unpin` 配对使用。
    pub fn pin(&self) {
        self.bcache.pin(self.index, self.dev, self.blockno);
    }

    /// 将当前缓冲块的引用计数减一，表示释放“钉住”状态。
    ///
    /// # 可能的错误
    /// - 没有与之对应的 `pin` 时 panic（`"buf unpin not match"`）。
    pub fn unpin(&self) {
        self.bcache.unpin(self.index, self.dev, self.blockno);
    }
}

impl<'a> Deref for Buf<'a> {
    type Target = BufData;

    fn deref(&self) -> &BufData {
        self.data.as_ref().unwrap()
    }
}

impl<'a> DerefMut for Buf<'a> {
    fn deref_mut(&mut self) -> &mut BufData {
        self.data.as_mut().unwrap()
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        let data = self.data.take().unwrap();
        if !data.holding() {
            // 睡眠锁属于别的执行单元，不能替它解锁
            mem::forget(data);
            if std::thread::panicking() {
                return;
            }
            panic!("brelse");
        }
        drop(data);
        self.bcache.release(self.index, self.dev, self.blockno);
    }
}

/// 一个哈希桶：当前归属于该桶的缓冲块控制信息，按加入顺序排列。
struct Bucket {
    ctrls: Vec<BufCtrl>,
}

impl Bucket {
    const fn new() -> Self {
        Self { ctrls: Vec::new() }
    }

    /// 查找 `(dev, blockno)`，命中则引用计数加一并返回缓冲块编号。
    fn find_cached(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        self.ctrls
            .iter_mut()
            .find(|c| c.block == Some((dev, blockno)))
            .map(|c| {
                c.refcnt += 1;
                c.index
            })
    }

    /// 本桶中引用计数为 0 且释放时间戳最小的缓冲块：`(位置, 时间戳)`。
    fn lru_idle(&self) -> Option<(usize, u64)> {
        self.ctrls
            .iter()
            .enumerate()
            .filter(|(_, c)| c.refcnt == 0)
            .min_by_key(|(_, c)| c.lastuse)
            .map(|(pos, c)| (pos, c.lastuse))
    }

    fn ctrl_mut(&mut self, index: usize) -> &mut BufCtrl {
        match self.ctrls.iter_mut().find(|c| c.index == index) {
            Some(ctrl) => ctrl,
            None => panic!("bcache: buf {} not in its bucket", index),
        }
    }
}

/// 缓冲块控制结构，记录缓冲块的元信息，受所在桶的锁保护。
struct BufCtrl {
    /// 缓冲块编号，对应 `Bcache::bufs` 的下标。
    index: usize,

    /// 绑定的磁盘块 `(dev, blockno)`，从未使用过的缓冲块为 `None`。
    block: Option<(u32, u32)>,

    /// 引用计数。
    ///
    /// 大于 0 时该缓冲块不会被替换或迁移。
    refcnt: usize,

    /// 引用计数最近一次归零时的时间戳，仅在 `refcnt == 0` 时有意义。
    lastuse: u64,
}

impl BufCtrl {
    const fn new(index: usize) -> Self {
        Self {
            index,
            block: None,
            refcnt: 0,
            lastuse: 0,
        }
    }
}

/// 缓冲块的数据部分，包含实际的磁盘块内容及其有效性标志。
struct BufInner {
    /// 标志该缓冲块的数据是否有效。
    ///
    /// 替换时在桶锁与仲裁锁保护下清除，在 `bread` 中持有睡眠锁时读取并设置。
    valid: AtomicBool,

    /// 缓冲块的实际数据，受睡眠锁保护，设备 I/O 期间一直持有。
    data: SleepLock<BufData>,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }
}

/// 一个磁盘块的内容。
///
/// 对齐方式应足以满足可能由此结构体解析出的磁盘结构的需求。
#[repr(C, align(8))]
#[derive(Clone)]
pub struct BufData([u8; BSIZE]);

impl BufData {
    pub const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Default for BufData {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for BufData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}
