#![cfg_attr(not(test), no_std)]

extern crate alloc;

/* sector-fs 的整体架构，自上而下 */

// 文件系统门面：格式化、挂载以及按路径创建、打开、删除
mod filesys;
pub use filesys::{FileSystem, WorkingDir};

// 一致性检查：核对位图与各 inode 的块映射
mod fsck;
pub use fsck::Report;

// 目录层：目录即是由目录项组成的文件，并负责路径解析
mod directory;
pub use directory::Dir;

// 打开的文件：带读写位置的 inode
mod file;
pub use file::File;

// 索引节点层：共享的打开 inode 表，按字节读写文件
mod inode;
pub use inode::Inode;

// 空闲扇区管理：位图分配器以及块映射的分配、扩展
mod free_map;

// 磁盘数据结构层：表示磁盘文件系统的数据结构
mod layout;
pub use layout::{BlockPath, DiskInodeKind, locate};

// 块缓存层：内存上的扇区缓存，时钟算法换出
mod block_cache;

mod sector;
pub use sector::SectorId;

pub use vfs::Error;

pub const SECTOR_SIZE: usize = block_dev::BLOCK_SIZE;
/// 块缓存的槽位数
pub const CACHE_CAPACITY: usize = 64;
/// 文件名的最大字节数
pub const NAME_MAX: usize = 14;
/// 空闲位图文件的 inode 所在扇区
pub const FREE_MAP_SECTOR: SectorId = SectorId::new(0);
/// 根目录的 inode 所在扇区
pub const ROOT_DIR_SECTOR: SectorId = SectorId::new(1);
/// 新目录预留的目录项个数
pub const ROOT_DIR_ENTRIES: usize = 16;
/// inode 魔数，打开时校验
pub const MAGIC: u32 = 0x494e_4f44;

pub type Result<T> = core::result::Result<T, Error>;

type DataBlock = [u8; SECTOR_SIZE];
