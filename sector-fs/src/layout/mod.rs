//! # 磁盘数据结构层
//!
//! sector-fs 的磁盘布局：
//! 位图文件的 inode(扇区0) | 根目录 inode(扇区1) | inode、索引块、数据块混杂
//!
//! 除了 inode 自带的类型与魔数外，扇区的用途只能从上下文得知。

mod bitmap;
pub use bitmap::Bitmap;

mod inode;
pub use inode::{
    BlockPath, DiskInode, DiskInodeKind, IndirectBlock, locate, DIRECT_COUNT, EMPTY_INDIRECT,
    INDIRECT1_CAP, INDIRECT_COUNT, MAX_FILE_BLOCKS,
};

/// 目录项，也属于磁盘文件系统数据结构
mod dir_entry;
pub use dir_entry::DirEntry;
