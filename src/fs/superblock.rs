//! 超级块操作
//!
//! 磁盘布局：
//! [ 引导块 | 超级块 | 日志 | 索引节点块 | 空闲位图 | 数据块 ]

use crate::consts::fs::{BPB, FSMAGIC, IPB, SUPERBLOCK_NO};
use super::{Bcache, BufData};

/// 超级块，描述磁盘布局
///
/// 磁盘上按字段顺序依次存放 8 个小端序 `u32`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    pub magic: u32,      // 文件系统魔数，必须为`FSMAGIC`
    pub size: u32,       // 文件系统映像总块数
    pub nblocks: u32,    // 数据块数量（不含元数据）
    pub ninodes: u32,    // 索引节点总数
    pub nlog: u32,       // 日志块数量
    pub logstart: u32,   // 第一个日志块的块号
    pub inodestart: u32, // 第一个索引节点块的块号
    pub bmapstart: u32,  // 第一个位图块的块号
}

impl SuperBlock {
    /// 按标准布局计算超级块
    ///
    /// # 参数
    /// - `size`: 文件系统映像总块数
    /// - `nlog`: 日志区块数（含日志头块）
    /// - `ninodes`: 索引节点总数
    ///
    /// # Panics
    /// 元数据区超过映像大小时触发panic
    pub fn new(size: u32, nlog: u32, ninodes: u32) -> Self {
        let ninodeblocks = ninodes / IPB as u32 + 1;
        let nbitmap = size / BPB + 1;
        let nmeta = 2 + nlog + ninodeblocks + nbitmap;
        if nmeta >= size {
            panic!("superblock: {} meta blocks exceed image of {} blocks", nmeta, size);
        }
        Self {
            magic: FSMAGIC,
            size,
            nblocks: size - nmeta,
            ninodes,
            nlog,
            logstart: 2,
            inodestart: 2 + nlog,
            bmapstart: 2 + nlog + ninodeblocks,
        }
    }

    /// 从磁盘设备读取超级块
    ///
    /// # 功能说明
    /// 1. 通过块缓存读取指定设备的块1
    /// 2. 解码各字段
    /// 3. 验证文件系统魔数（FSMAGIC）
    ///
    /// # Panics
    /// - 文件系统魔数不匹配时触发panic
    pub fn read(bcache: &Bcache, dev: u32) -> Self {
        let buf = bcache.bread(dev, SUPERBLOCK_NO);
        let sb = Self::decode(&buf);
        drop(buf);
        if sb.magic != FSMAGIC {
            panic!("invalid file system magic num");
        }
        sb
    }

    /// 将超级块写入设备的块1
    pub fn write(&self, bcache: &Bcache, dev: u32) {
        let mut buf = bcache.bread(dev, SUPERBLOCK_NO);
        buf.fill(0);
        self.encode(&mut buf);
        buf.bwrite();
    }

    /// 读取日志区域信息
    ///
    /// # 返回值
    /// 元组`(起始块号, 日志块数量)`
    pub fn read_log(&self) -> (u32, u32) {
        (self.logstart, self.nlog)
    }

    /// 获取文件系统总块数
    pub fn size(&self) -> u32 {
        self.size
    }

    fn fields(&self) -> [u32; 8] {
        [
            self.magic, self.size, self.nblocks, self.ninodes,
            self.nlog, self.logstart, self.inodestart, self.bmapstart,
        ]
    }

    fn encode(&self, data: &mut BufData) {
        for (i, field) in self.fields().iter().enumerate() {
            data[4 * i..4 * i + 4].copy_from_slice(&field.to_le_bytes());
        }
    }

    fn decode(data: &BufData) -> Self {
        let word = |i: usize| {
            let o = 4 * i;
            u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]])
        };
        Self {
            magic: word(0),
            size: word(1),
            nblocks: word(2),
            ninodes: word(3),
            nlog: word(4),
            logstart: word(5),
            inodestart: word(6),
            bmapstart: word(7),
        }
    }
}
