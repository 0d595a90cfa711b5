//! # 块设备接口层
//!
//! 块设备是以**块**（扇区）为单位存储数据的设备；
//! [`BlockDevice`] 就是对读写块设备的抽象，
//! 实现了此特质的类型称为**块设备驱动**。
//!
//! 读写都是同步的、整块的，没有队列。

#![no_std]

extern crate alloc;

mod ram_disk;

use core::any::Any;
use core::fmt::Debug;

pub use self::ram_disk::RamDisk;

/// 块（扇区）大小
pub const BLOCK_SIZE: usize = 512;

/// 块设备驱动特质
pub trait BlockDevice: Send + Sync + Any + Debug {
    /// 读出整块，`buf` 的长度必须是 [`BLOCK_SIZE`]
    fn read_block(&self, block_id: usize, buf: &mut [u8]);

    /// 写入整块，`buf` 的长度必须是 [`BLOCK_SIZE`]
    fn write_block(&self, block_id: usize, buf: &[u8]);

    /// 设备的总块数
    fn num_blocks(&self) -> usize;
}
