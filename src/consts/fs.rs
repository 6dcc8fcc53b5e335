//! 文件系统与块缓存相关常量

/// 磁盘块大小（字节）
pub const BSIZE: usize = 1024;

/// 单次文件系统操作最多写入的块数
pub const MAXOPBLOCKS: usize = 10;

/// 日志头最多可记录的块号数量
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

/// 默认的缓冲块数量，须大于 `LOGSIZE`，提交时除被钉住的块外还要读写日志块
pub const NBUF: usize = MAXOPBLOCKS * 4;

/// 块缓存哈希桶数量，取素数以打散 `(dev, blockno)`
pub const NBUCKET: usize = 13;

/// 文件系统魔数
pub const FSMAGIC: u32 = 0x10203040;

/// 根文件系统所在设备号
pub const ROOTDEV: u32 = 1;

/// 超级块所在块号，块 0 为引导块
pub const SUPERBLOCK_NO: u32 = 1;

/// 磁盘索引节点大小（字节），用于计算磁盘布局
pub const DINODE_SIZE: usize = 64;

/// 每个块可存放的索引节点数
pub const IPB: usize = BSIZE / DINODE_SIZE;

/// 每个位图块管理的块数
pub const BPB: u32 = (BSIZE * 8) as u32;
