//! 日志层
//!
//! 简单的写前日志，允许多个文件系统操作并发执行。
//!
//! 一个日志事务包含多个文件系统操作的更新，只有在没有活跃操作时才提交，
//! 因此不需要考虑提交是否会把某个未完成操作的更新写到磁盘上。
//!
//! 每个操作以 [`Log::begin_op`] 开始、[`Log::end_op`] 结束。通常 `begin_op`
//! 只是把进行中的操作数加一；但如果日志空间可能不够，它会睡眠直到最后一个
//! `end_op` 完成提交。
//!
//! 日志是物理重做日志，磁盘格式为：
//!
//! ```text
//! 日志头块：记录块 A、B、C ... 的块号
//! 块 A
//! 块 B
//! 块 C
//! ...
//! ```
//!
//! 日志写入是同步的。

use log::{debug, info};

use crate::consts::fs::{BSIZE, LOGSIZE, MAXOPBLOCKS};
use crate::process::WaitQueue;
use crate::spinlock::SpinLock;
use super::{Bcache, Buf, BufData, SuperBlock};

// 日志头必须能放进一个块
const _: () = assert!(4 + 4 * LOGSIZE <= BSIZE);

/// 用于记录和管理文件系统日志的核心结构体。
///
/// `Log` 实现了一个简化的事务性日志机制（write-ahead log），
/// 以确保多步文件系统更新的原子性与崩溃恢复能力。
/// 它记录了日志区域的位置、事务状态以及当前事务中涉及的块号。
///
/// 状态机（每个事务窗口）：接收操作 → 提交中 → 接收操作。
pub struct Log<'a> {
    bcache: &'a Bcache,
    /// 所在磁盘设备的编号
    dev: u32,
    /// 日志区在磁盘中的起始块号（日志头块）
    start: u32,
    /// 日志区域的块数（包括日志头块和数据块）
    size: u32,
    state: SpinLock<LogState>,
    /// 等待提交结束或日志空间的操作
    wq: WaitQueue,
}

/// 受日志锁保护的可变状态
struct LogState {
    /// 当前正在进行的文件系统操作数
    outstanding: u32,
    /// 指示日志系统是否正在提交事务，为 true 时禁止新的文件系统操作进入
    committing: bool,
    /// 当前事务的日志头，记录了修改的块号及数量
    lh: LogHeader,
}

impl<'a> Log<'a> {
    /// 初始化日志系统并在必要时执行崩溃恢复。
    ///
    /// # 功能说明
    /// 本函数在挂载文件系统时调用一次，先于任何文件系统操作。
    /// 从超级块得到日志区域的起始位置与大小，初始化日志系统的内部状态；
    /// 若磁盘上的日志头中仍有记录，说明上次有已提交但未安装完成的事务，
    /// 会把日志区中的块写回原位置，以保证文件系统一致性。
    ///
    /// # 参数
    /// - `bcache`: 日志所使用的块缓存；
    /// - `dev`: 日志所在的块设备编号；
    /// - `sb`: 该设备的超级块。
    ///
    /// # 可能的错误
    /// - 日志区域容纳不下一个完整操作（`MAXOPBLOCKS` 个数据块加日志头）时 panic；
    /// - 块缓存的缓冲块数不多于单个事务的容量时 panic：满事务钉住的块之外，
    ///   提交至少还需要一个缓冲块来读写日志区；
    /// - 磁盘上的日志头计数超出 `LOGSIZE` 时 panic。
    pub fn init(bcache: &'a Bcache, dev: u32, sb: &SuperBlock) -> Self {
        let (start, size) = sb.read_log();
        if (size as usize) < MAXOPBLOCKS + 1 {
            panic!("log: region of {} blocks too small", size);
        }
        let log = Self {
            bcache,
            dev,
            start,
            size,
            state: SpinLock::new(LogState {
                outstanding: 0,
                committing: false,
                lh: LogHeader::empty(),
            }, "log"),
            wq: WaitQueue::new("log.wq"),
        };
        if bcache.capacity() <= log.capacity() {
            panic!("log: {} buffers cannot commit a {}-block transaction",
                bcache.capacity(), log.capacity());
        }
        log.recover();
        log
    }

    /// 单个事务最多可以记录的块数。
    pub fn capacity(&self) -> usize {
        LOGSIZE.min(self.size as usize - 1)
    }

    /// 当前事务已记录的块数。
    pub fn pending(&self) -> usize {
        self.state.lock().lh.len as usize
    }

    /// 执行日志恢复流程（若存在未完成事务）。
    ///
    /// # 流程解释
    /// 1. 读取磁盘上的日志头；
    /// 2. 若其中记录数大于 0，说明该事务已提交但可能未安装完：
    ///     - 将日志块写回其原始位置；
    ///     - 清空磁盘中的日志头；
    /// 3. 否则无需恢复，不产生任何写入。
    ///
    /// 日志头只在安装完成后才清空，因此重复执行恢复是安全的。
    fn recover(&self) {
        info!("file system: checking logs");
        let lh = self.read_head();
        if lh.len > 0 {
            info!("file system: recovering {} blocks from logs", lh.len);
            self.install_trans(&lh, true);
            self.empty_head();
        } else {
            info!("file system: no need to recover");
        }
    }

    /// 从磁盘中读取日志头。
    fn read_head(&self) -> LogHeader {
        let buf = self.bcache.bread(self.dev, self.start);
        LogHeader::decode(&buf)
    }

    /// 将日志头写入磁盘。
    /// 这是当前事务真正被提交的时间点。
    fn write_head(&self, lh: &LogHeader) {
        let mut buf = self.bcache.bread(self.dev, self.start);
        lh.encode(&mut buf);
        buf.bwrite();
    }

    /// 将磁盘上日志头的记录数清零，标志事务已完全安装。
    fn empty_head(&self) {
        let mut buf = self.bcache.bread(self.dev, self.start);
        buf[..4].copy_from_slice(&0u32.to_le_bytes());
        buf.bwrite();
    }

    /// 将日志中已提交的块复制回它们原本在磁盘中的位置。
    ///
    /// # 功能说明
    /// 可用于两种场景：
    /// - 正常事务提交（`recovering = false`）：复制数据后解除对缓存块的钉住；
    /// - 挂载时崩溃恢复（`recovering = true`）：仅复制数据，恢复时没有块被钉住。
    fn install_trans(&self, lh: &LogHeader, recovering: bool) {
        for (tail, &blockno) in lh.blocks().iter().enumerate() {
            let log_buf = self.bcache.bread(self.dev, self.start + 1 + tail as u32);
            let mut disk_buf = self.bcache.bread(self.dev, blockno);
            disk_buf.copy_from_slice(&log_buf);
            disk_buf.bwrite();
            if !recovering {
                disk_buf.unpin();
            }
        }
    }

    /// 将缓存中修改过的块复制到日志区域的磁盘块中。
    fn write_log(&self, lh: &LogHeader) {
        for (tail, &blockno) in lh.blocks().iter().enumerate() {
            let mut to = self.bcache.bread(self.dev, self.start + 1 + tail as u32);
            let from = self.bcache.bread(self.dev, blockno);
            to.copy_from_slice(&from);
            to.bwrite();
        }
    }

    /// 提交日志。
    ///
    /// # 流程解释
    /// 若当前事务记录了块：
    /// 1. [`Log::write_log`]：把修改后的块从缓存写入日志区；
    /// 2. [`Log::write_head`]：把日志头写入磁盘，这是事务真正的提交点，
    ///    此后即使崩溃，恢复时也会重做该事务；
    /// 3. [`Log::install_trans`]：把日志块写回原始位置并解除钉住；
    /// 4. [`Log::empty_head`]：清空日志头，表示事务已完全安装。
    ///
    /// 调用者须已将 `committing` 置位且不持有任何自旋锁。
    ///
    /// # 可能的错误
    /// - 未设置 `committing` 或仍有操作未结束时 panic。
    fn commit(&self, lh: &LogHeader) {
        {
            let guard = self.state.lock();
            if !guard.committing {
                panic!("log: committing while the committing flag is not set");
            }
            if guard.outstanding != 0 {
                panic!("log: committing with {} operations outstanding", guard.outstanding);
            }
        }
        if lh.len > 0 {
            self.write_log(lh);
            self.write_head(lh);
            self.install_trans(lh, false);
            self.empty_head();
            debug!("log: committed {} blocks", lh.len);
        }
    }

    /// 在每次文件系统操作开始时调用。
    ///
    /// # 功能说明
    /// 等待直到日志不处于提交状态，且日志剩余空间足以容纳本操作的最坏情况：
    /// 已记录块数加上所有已进入操作（含本次）各预留 `MAXOPBLOCKS` 块，
    /// 不能超过日志容量。满足条件后进行中的操作数加一。
    pub fn begin_op(&self) {
        let mut guard = self.state.lock();
        loop {
            let reserved = (guard.outstanding as usize + 1) * MAXOPBLOCKS;
            if guard.committing || guard.lh.len as usize + reserved > self.capacity() {
                // 等待提交完成或有操作结束
                self.wq.sleep(guard);
                guard = self.state.lock();
            } else {
                guard.outstanding += 1;
                break;
            }
        }
    }

    /// 将给定的缓冲块记录到当前事务中，代替直接的 `bwrite`。
    ///
    /// # 功能说明
    /// 被修改的块号登记到日志头中，提交时统一写入磁盘。
    /// 同一事务中重复写入的块只占用一个位置（日志吸收），提交时取缓存中的最终内容。
    /// 首次登记的缓冲块会被钉住，直到事务安装完成，防止其在提交前被替换。
    ///
    /// 典型用法：
    /// ```ignore
    /// let mut buf = bcache.bread(dev, blockno);
    /// buf[..].copy_from_slice(...);
    /// log.write(buf);
    /// ```
    ///
    /// # 可能的错误
    /// - 不在 `begin_op`/`end_op` 之间调用时 panic；
    /// - 缓冲块不属于日志所在设备时 panic；
    /// - 事务记录的块数将超过日志容量时 panic。
    pub fn write(&self, buf: Buf<'_>) {
        let mut guard = self.state.lock();
        if guard.outstanding < 1 {
            panic!("log: write outside of transaction");
        }
        if buf.read_dev() != self.dev {
            panic!("log: write to dev {} but log is on dev {}", buf.read_dev(), self.dev);
        }

        let blockno = buf.read_blockno();
        if guard.lh.blocks().contains(&blockno) {
            return;
        }
        let len = guard.lh.len as usize;
        if len >= self.capacity() {
            panic!("log: too big a transaction");
        }
        buf.pin();
        guard.lh.blocknos[len] = blockno;
        guard.lh.len += 1;
    }

    /// 在每次文件系统操作结束时调用，必要时提交日志。
    ///
    /// # 流程解释
    /// 1. 获取日志锁，减少 `outstanding` 计数；
    /// 2. 如果计数归零，说明当前事务中所有操作都已完成：置位 `committing`，
    ///    取出日志头副本，在不持锁的情况下由本执行单元执行提交；
    ///    提交完成后清空内存日志头、清除 `committing` 并唤醒等待者；
    /// 3. 否则唤醒等待日志空间的执行单元（预留空间减少了）。
    ///
    /// # 可能的错误
    /// - 没有对应的 `begin_op` 时 panic；
    /// - 在日志提交过程中调用时 panic。
    pub fn end_op(&self) {
        let mut guard = self.state.lock();
        if guard.outstanding == 0 {
            panic!("log: end_op without begin_op");
        }
        if guard.committing {
            panic!("log: end fs op while the log is committing");
        }
        guard.outstanding -= 1;

        let commit = if guard.outstanding == 0 {
            guard.committing = true;
            Some(guard.lh)
        } else {
            self.wq.wakeup();
            None
        };
        drop(guard);

        if let Some(lh) = commit {
            // 提交期间 committing 阻止新操作进入，日志头不会被修改
            self.commit(&lh);
            let mut guard = self.state.lock();
            guard.lh.len = 0;
            guard.committing = false;
            self.wq.wakeup();
            drop(guard);
        }
    }
}

/// 日志头，记录当前事务中被修改的磁盘块号。
///
/// 存储在日志区域的第一个块中，磁盘格式为小端序的 `u32` 记录数，
/// 后接 `LOGSIZE` 个 `u32` 块号（只有前 `len` 个有意义）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LogHeader {
    len: u32,
    blocknos: [u32; LOGSIZE],
}

impl LogHeader {
    const fn empty() -> Self {
        Self { len: 0, blocknos: [0; LOGSIZE] }
    }

    fn blocks(&self) -> &[u32] {
        &self.blocknos[..self.len as usize]
    }

    fn decode(data: &BufData) -> Self {
        let word = |i: usize| {
            let o = 4 * i;
            u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]])
        };
        let len = word(0);
        if len as usize > LOGSIZE {
            panic!("log: corrupted header with {} entries", len);
        }
        let mut lh = Self::empty();
        lh.len = len;
        for i in 0..len as usize {
            lh.blocknos[i] = word(i + 1);
        }
        lh
    }

    fn encode(&self, data: &mut BufData) {
        data[..4].copy_from_slice(&self.len.to_le_bytes());
        for (i, blockno) in self.blocknos.iter().enumerate() {
            data[4 * (i + 1)..4 * (i + 2)].copy_from_slice(&blockno.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use crate::consts::fs::ROOTDEV;
    use crate::driver::RamDisk;
    use crate::fs::mkfs;

    const NLOG: u32 = LOGSIZE as u32 + 1;

    fn formatted() -> Arc<RamDisk> {
        let disk = Arc::new(RamDisk::new(200));
        let bcache = Bcache::new(disk.clone(), 8);
        mkfs(&bcache, ROOTDEV, &SuperBlock::new(200, NLOG, 16));
        disk
    }

    fn header_len(disk: &RamDisk, sb: &SuperBlock) -> u32 {
        let (start, _) = sb.read_log();
        u32::from_le_bytes(disk.peek(ROOTDEV, start)[..4].try_into().unwrap())
    }

    #[test]
    fn header_layout() {
        let mut lh = LogHeader::empty();
        lh.len = 2;
        lh.blocknos[0] = 10;
        lh.blocknos[1] = 20;
        let mut data = BufData::new();
        lh.encode(&mut data);
        assert_eq!(&data[..12], &[2, 0, 0, 0, 10, 0, 0, 0, 20, 0, 0, 0]);
        assert_eq!(LogHeader::decode(&data), lh);
    }

    #[test]
    #[should_panic(expected = "corrupted header")]
    fn oversized_header_is_rejected() {
        let mut data = BufData::new();
        data[..4].copy_from_slice(&(LOGSIZE as u32 + 1).to_le_bytes());
        LogHeader::decode(&data);
    }

    #[test]
    fn empty_transaction_writes_nothing() {
        let disk = formatted();
        let bcache = Bcache::with_default(disk.clone());
        let sb = SuperBlock::read(&bcache, ROOTDEV);
        let log = Log::init(&bcache, ROOTDEV, &sb);
        let before = disk.write_count();
        log.begin_op();
        log.end_op();
        assert_eq!(disk.write_count(), before);
    }

    #[test]
    fn absorbed_writes_commit_final_content() {
        let disk = formatted();
        let bcache = Bcache::with_default(disk.clone());
        let sb = SuperBlock::read(&bcache, ROOTDEV);
        let log = Log::init(&bcache, ROOTDEV, &sb);

        log.begin_op();
        let mut b = bcache.bread(ROOTDEV, 100);
        b[0] = 1;
        log.write(b);
        let mut b = bcache.bread(ROOTDEV, 100);
        b[0] = 2;
        log.write(b);
        assert_eq!(log.pending(), 1);
        // 提交前不会写到原位置
        assert_eq!(disk.peek(ROOTDEV, 100)[0], 0);
        log.end_op();

        assert_eq!(log.pending(), 0);
        assert_eq!(disk.peek(ROOTDEV, 100)[0], 2);
        assert_eq!(header_len(&disk, &sb), 0);
        // 日志区第一个数据块保存着提交时的副本
        assert_eq!(disk.peek(ROOTDEV, sb.read_log().0 + 1)[0], 2);
        // 安装后钉住已解除
        assert!(bcache.snapshot().iter().all(|&(_, _, refcnt)| refcnt == 0));
    }

    #[test]
    fn commit_waits_for_last_operation() {
        let disk = formatted();
        let bcache = Bcache::with_default(disk.clone());
        let sb = SuperBlock::read(&bcache, ROOTDEV);
        let log = Log::init(&bcache, ROOTDEV, &sb);

        log.begin_op();
        log.begin_op();
        let mut b = bcache.bread(ROOTDEV, 150);
        b[0] = 9;
        log.write(b);
        log.end_op();
        assert_eq!(disk.peek(ROOTDEV, 150)[0], 0);
        log.end_op();
        assert_eq!(disk.peek(ROOTDEV, 150)[0], 9);
    }

    #[test]
    #[should_panic(expected = "log: write outside of transaction")]
    fn write_outside_transaction() {
        let disk = formatted();
        let bcache = Bcache::with_default(disk);
        let sb = SuperBlock::read(&bcache, ROOTDEV);
        let log = Log::init(&bcache, ROOTDEV, &sb);
        log.write(bcache.bread(ROOTDEV, 100));
    }

    #[test]
    #[should_panic(expected = "log: end_op without begin_op")]
    fn unpaired_end_op() {
        let disk = formatted();
        let bcache = Bcache::with_default(disk);
        let sb = SuperBlock::read(&bcache, ROOTDEV);
        let log = Log::init(&bcache, ROOTDEV, &sb);
        log.end_op();
    }

    #[test]
    #[should_panic(expected = "log: too big a transaction")]
    fn transaction_over_capacity() {
        let disk = formatted();
        let bcache = Bcache::new(disk, LOGSIZE + 4);
        let sb = SuperBlock::read(&bcache, ROOTDEV);
        let log = Log::init(&bcache, ROOTDEV, &sb);
        log.begin_op();
        for blockno in 0..=LOGSIZE as u32 {
            log.write(bcache.bread(ROOTDEV, 100 + blockno));
        }
    }

    #[test]
    #[should_panic(expected = "too small")]
    fn tiny_log_region() {
        let disk = Arc::new(RamDisk::new(100));
        let bcache = Bcache::new(disk, 8);
        mkfs(&bcache, ROOTDEV, &SuperBlock::new(100, MAXOPBLOCKS as u32, 16));
        let sb = SuperBlock::read(&bcache, ROOTDEV);
        Log::init(&bcache, ROOTDEV, &sb);
    }

    #[test]
    fn full_transaction_commits_on_default_cache() {
        let disk = formatted();
        let bcache = Bcache::with_default(disk.clone());
        let sb = SuperBlock::read(&bcache, ROOTDEV);
        let log = Log::init(&bcache, ROOTDEV, &sb);
        let slots = log.capacity() / MAXOPBLOCKS;

        for _ in 0..slots {
            log.begin_op();
        }
        for i in 0..log.capacity() as u32 {
            let mut b = bcache.bread(ROOTDEV, 100 + i);
            b[0] = i as u8 + 1;
            log.write(b);
        }
        assert_eq!(log.pending(), LOGSIZE);
        for _ in 0..slots {
            log.end_op();
        }

        assert_eq!(log.pending(), 0);
        for i in 0..LOGSIZE as u32 {
            assert_eq!(disk.peek(ROOTDEV, 100 + i)[0], i as u8 + 1);
        }
        assert_eq!(header_len(&disk, &sb), 0);
        // 提交结束后仍能接纳新的操作
        log.begin_op();
        log.end_op();
    }

    #[test]
    #[should_panic(expected = "cannot commit")]
    fn cache_smaller_than_transaction() {
        let disk = formatted();
        let bcache = Bcache::new(disk, LOGSIZE);
        let sb = SuperBlock::read(&bcache, ROOTDEV);
        Log::init(&bcache, ROOTDEV, &sb);
    }

    #[test]
    #[should_panic(expected = "log: write to dev 2 but log is on dev 1")]
    fn write_to_foreign_device() {
        let disk = formatted();
        let bcache = Bcache::with_default(disk);
        let sb = SuperBlock::read(&bcache, ROOTDEV);
        let log = Log::init(&bcache, ROOTDEV, &sb);
        log.begin_op();
        log.write(bcache.bread(ROOTDEV + 1, 100));
    }

    #[test]
    #[should_panic(expected = "committing flag is not set")]
    fn commit_outside_end_op() {
        let disk = formatted();
        let bcache = Bcache::with_default(disk);
        let sb = SuperBlock::read(&bcache, ROOTDEV);
        let log = Log::init(&bcache, ROOTDEV, &sb);
        log.commit(&LogHeader::empty());
    }
}
