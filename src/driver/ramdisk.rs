//! 内存盘

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::warn;

use crate::fs::BufData;
use crate::spinlock::SpinLock;
use super::BlockDevice;

/// 完全驻留内存的块设备，可同时承载多个设备号。
///
/// 每个设备号在第一次访问时创建，含 `nblocks` 个全零块。
/// 除读写外还提供测试与诊断需要的能力：
/// - 按块统计读次数、统计总写次数；
/// - 掉电注入：[`RamDisk::crash_after`] 之后，超出额度的写入被静默丢弃，
///   模拟写到一半断电；
/// - [`RamDisk::power_cycle`] 得到只包含已落盘内容的新设备，模拟重启。
pub struct RamDisk {
    nblocks: u32,
    disks: SpinLock<BTreeMap<u32, Vec<BufData>>>,
    reads: SpinLock<BTreeMap<(u32, u32), usize>>,
    writes: AtomicUsize,
    /// 掉电前还允许落盘的写次数，`None` 表示不限
    budget: SpinLock<Option<usize>>,
    dropped: AtomicUsize,
}

impl RamDisk {
    pub fn new(nblocks: u32) -> Self {
        Self {
            nblocks,
            disks: SpinLock::new(BTreeMap::new(), "ramdisk"),
            reads: SpinLock::new(BTreeMap::new(), "ramdisk.reads"),
            writes: AtomicUsize::new(0),
            budget: SpinLock::new(None, "ramdisk.budget"),
            dropped: AtomicUsize::new(0),
        }
    }

    /// 再允许 `writes` 次写入落盘，之后的写入全部丢弃。
    pub fn crash_after(&self, writes: usize) {
        *self.budget.lock() = Some(writes);
    }

    /// 是否已经发生过掉电（有写入被丢弃）。
    pub fn crashed(&self) -> bool {
        self.dropped.load(Ordering::Relaxed) > 0
    }

    /// 模拟重启：返回一个只含已落盘内容的新设备，计数器清零，不再注入掉电。
    pub fn power_cycle(&self) -> RamDisk {
        let disks = self.disks.lock().clone();
        let disk = RamDisk::new(self.nblocks);
        *disk.disks.lock() = disks;
        disk
    }

    /// 绕过统计直接读取块内容，供检查使用。
    pub fn peek(&self, dev: u32, blockno: u32) -> BufData {
        let mut data = BufData::new();
        self.copy_out(dev, blockno, &mut data);
        data
    }

    /// 绕过统计与掉电注入直接写入块内容，供构造磁盘镜像使用。
    pub fn poke(&self, dev: u32, blockno: u32, bytes: &[u8]) {
        self.check_range(blockno);
        let mut disks = self.disks.lock();
        let blocks = Self::device(&mut disks, dev, self.nblocks);
        let block = &mut blocks[blockno as usize];
        block.fill(0);
        block[..bytes.len()].copy_from_slice(bytes);
    }

    /// `(dev, blockno)` 被读取的次数。
    pub fn reads_of(&self, dev: u32, blockno: u32) -> usize {
        self.reads.lock().get(&(dev, blockno)).copied().unwrap_or(0)
    }

    /// 已落盘的写入总次数。
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    fn check_range(&self, blockno: u32) {
        if blockno >= self.nblocks {
            panic!("ramdisk: blockno {} out of range {}", blockno, self.nblocks);
        }
    }

    fn device(disks: &mut BTreeMap<u32, Vec<BufData>>, dev: u32, nblocks: u32) -> &mut Vec<BufData> {
        disks.entry(dev).or_insert_with(|| {
            let mut blocks = Vec::with_capacity(nblocks as usize);
            blocks.resize_with(nblocks as usize, BufData::new);
            blocks
        })
    }

    fn copy_out(&self, dev: u32, blockno: u32, data: &mut BufData) {
        self.check_range(blockno);
        let mut disks = self.disks.lock();
        let blocks = Self::device(&mut disks, dev, self.nblocks);
        data.copy_from_slice(&blocks[blockno as usize]);
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, dev: u32, blockno: u32, data: &mut BufData) {
        self.copy_out(dev, blockno, data);
        *self.reads.lock().entry((dev, blockno)).or_insert(0) += 1;
    }

    fn write_block(&self, dev: u32, blockno: u32, data: &BufData) {
        self.check_range(blockno);
        {
            let mut budget = self.budget.lock();
            match budget.as_mut() {
                Some(0) => {
                    if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                        warn!("ramdisk: power lost, dropping write to {}:{}", dev, blockno);
                    }
                    return;
                }
                Some(left) => *left -= 1,
                None => {}
            }
        }
        let mut disks = self.disks.lock();
        let blocks = Self::device(&mut disks, dev, self.nblocks);
        blocks[blockno as usize].copy_from_slice(data);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devices_are_independent() {
        let disk = RamDisk::new(8);
        let mut data = BufData::new();
        data[0] = 7;
        disk.write_block(1, 3, &data);
        assert_eq!(disk.peek(1, 3)[0], 7);
        assert_eq!(disk.peek(2, 3)[0], 0);
    }

    #[test]
    fn counts_reads_and_writes() {
        let disk = RamDisk::new(4);
        let mut data = BufData::new();
        disk.read_block(1, 2, &mut data);
        disk.read_block(1, 2, &mut data);
        disk.write_block(1, 0, &data);
        assert_eq!(disk.reads_of(1, 2), 2);
        assert_eq!(disk.reads_of(1, 0), 0);
        assert_eq!(disk.write_count(), 1);
    }

    #[test]
    fn writes_after_crash_point_are_lost() {
        let disk = RamDisk::new(4);
        let mut data = BufData::new();
        disk.crash_after(1);
        data[0] = 1;
        disk.write_block(1, 0, &data);
        data[0] = 2;
        disk.write_block(1, 1, &data);
        assert!(disk.crashed());

        let rebooted = disk.power_cycle();
        assert_eq!(rebooted.peek(1, 0)[0], 1);
        assert_eq!(rebooted.peek(1, 1)[0], 0);
        assert!(!rebooted.crashed());
        data[0] = 3;
        rebooted.write_block(1, 1, &data);
        assert_eq!(rebooted.peek(1, 1)[0], 3);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_block() {
        RamDisk::new(2).peek(1, 2);
    }
}
