//! 磁盘上的 inode 与间接索引块
//! - 直接索引：inode 内联 [`DIRECT_COUNT`] 个块编号，每个编号指向一个**数据块**
//! - 一级索引：整个块连续存储**块编号**，每个编号都指向一个数据块
//! - 二级索引：整个块连续存储**块编号**，每个编号都指向一个一级索引块
//!
//! 目录的空间用于存放目录项；文件的空间用于存放它的数据。
//!
//! ## 块索引编码
//!
//! - 二级索引内的块索引除以一级索引块的**可编号数量**，得到一级索引块在二级索引块中的位置
//! - 模一级索引块的可编号数量，得到数据块在一级索引块内的位置

use alloc::vec::Vec;
use core::mem;

use crate::block_cache::BufferCache;
use crate::sector::{SectorId, SectorSlot};
use crate::{MAGIC, SECTOR_SIZE};

/// 间接索引块的编号容量
pub const INDIRECT_COUNT: usize = SECTOR_SIZE / mem::size_of::<SectorSlot>();
/// 间接索引块
pub type IndirectBlock = [SectorSlot; INDIRECT_COUNT];
pub const EMPTY_INDIRECT: IndirectBlock = [SectorSlot::EMPTY; INDIRECT_COUNT];

/// 直接索引块可编号数量，恰好让 inode 占满一个扇区
pub const DIRECT_COUNT: usize = 122;
/// 一级索引块可编号数量
const INDIRECT1_COUNT: usize = INDIRECT_COUNT;
/// 二级索引块可编号数量
const INDIRECT2_COUNT: usize = INDIRECT_COUNT * INDIRECT_COUNT;
/// 直接索引时的编号容量
pub const DIRECT_CAP: usize = DIRECT_COUNT;
/// 用上一级索引时的编号容量
pub const INDIRECT1_CAP: usize = DIRECT_CAP + INDIRECT1_COUNT;
/// 用上二级索引时的编号容量
const INDIRECT2_CAP: usize = INDIRECT1_CAP + INDIRECT2_COUNT;
/// 单个文件最多能有的数据块数
pub const MAX_FILE_BLOCKS: usize = INDIRECT2_CAP;

/// 数据块在块映射中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPath {
    /// `direct[i]`
    Direct(usize),
    /// 一级索引块的第 i 项
    Single(usize),
    /// 二级索引块的第 i 项所指一级索引块的第 j 项
    Double(usize, usize),
}

/// 逻辑块索引到块映射位置的换算，超出容量时返回空
pub const fn locate(block_index: usize) -> Option<BlockPath> {
    if block_index < DIRECT_CAP {
        Some(BlockPath::Direct(block_index))
    } else if block_index < INDIRECT1_CAP {
        // 剔去直接索引的部分
        Some(BlockPath::Single(block_index - DIRECT_CAP))
    } else if block_index < INDIRECT2_CAP {
        // 剔去使用了一级索引的部分
        let index = block_index - INDIRECT1_CAP;
        Some(BlockPath::Double(
            index / INDIRECT1_COUNT,
            index % INDIRECT1_COUNT,
        ))
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DiskInodeKind {
    File = 0,
    Directory = 1,
}

/// 磁盘上的 inode，独占一个扇区
#[derive(Debug, Clone)]
#[repr(C)]
pub struct DiskInode {
    /// 文件长度(字节)，不用usize是为了严控布局
    pub length: u32,
    /// 类型，见 [`DiskInodeKind`]；存原始值，读坏的扇区也不会出现非法枚举
    kind: u32,
    /// 魔数：用于打开时的合法性校验
    magic: u32,
    /// 创建它的目录所在扇区
    pub parent: SectorId,
    /// 直接索引，存储容量：DIRECT_CAP * SECTOR_SIZE 字节
    direct: [SectorSlot; DIRECT_COUNT],
    /// 指向一个一级索引块
    single_indirect: SectorSlot,
    /// 指向一个二级索引块
    double_indirect: SectorSlot,
}

const _: () = assert!(mem::size_of::<DiskInode>() == SECTOR_SIZE);

impl DiskInode {
    pub fn new(length: u32, kind: DiskInodeKind, parent: SectorId) -> Self {
        Self {
            length,
            kind: kind as u32,
            magic: MAGIC,
            parent,
            direct: [SectorSlot::EMPTY; DIRECT_COUNT],
            single_indirect: SectorSlot::EMPTY,
            double_indirect: SectorSlot::EMPTY,
        }
    }

    #[inline]
    pub fn kind(&self) -> Option<DiskInodeKind> {
        match self.kind {
            0 => Some(DiskInodeKind::File),
            1 => Some(DiskInodeKind::Directory),
            _ => None,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC && self.kind().is_some()
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.kind() == Some(DiskInodeKind::Directory)
    }

    #[inline]
    pub fn direct(&self, index: usize) -> Option<SectorId> {
        self.direct[index].get()
    }

    #[inline]
    pub fn set_direct(&mut self, index: usize, sector: Option<SectorId>) {
        self.direct[index].set(sector);
    }

    #[inline]
    pub fn single_indirect(&self) -> Option<SectorId> {
        self.single_indirect.get()
    }

    #[inline]
    pub fn set_single_indirect(&mut self, sector: Option<SectorId>) {
        self.single_indirect.set(sector);
    }

    #[inline]
    pub fn double_indirect(&self) -> Option<SectorId> {
        self.double_indirect.get()
    }

    #[inline]
    pub fn set_double_indirect(&mut self, sector: Option<SectorId>) {
        self.double_indirect.set(sector);
    }

    /// 块映射是否一个块都没有
    pub fn is_unmapped(&self) -> bool {
        self.direct.iter().all(|slot| slot.is_empty())
            && self.single_indirect.is_empty()
            && self.double_indirect.is_empty()
    }

    /// 逻辑上 inode 指向一系列数据块，此处传入的是这些数据块的索引（逻辑索引），
    /// 然后返回给**块缓存层**使用的扇区号；未分配时返回空
    pub fn block_id(&self, block_index: usize, cache: &BufferCache) -> Option<SectorId> {
        match locate(block_index)? {
            BlockPath::Direct(i) => self.direct(i),
            BlockPath::Single(i) => {
                let table = self.single_indirect()?;
                cache.map(table, 0, |indirect1: &IndirectBlock| indirect1[i].get())
            }
            BlockPath::Double(i, j) => {
                let table = self.double_indirect()?;
                let indirect1 =
                    cache.map(table, 0, |indirect2: &IndirectBlock| indirect2[i].get())?;
                cache.map(indirect1, 0, |indirect1: &IndirectBlock| indirect1[j].get())
            }
        }
    }

    /// 按逻辑顺序列出前 `count` 个数据块
    pub fn data_sectors(&self, count: usize, cache: &BufferCache) -> Vec<SectorId> {
        (0..count)
            .map_while(|block_index| self.block_id(block_index, cache))
            .collect()
    }

    /// 块映射占用的全部扇区：数据块以及各级索引块，不含 inode 自身
    pub fn owned_sectors(&self, cache: &BufferCache) -> Vec<SectorId> {
        let mut sectors: Vec<SectorId> = self.direct.iter().filter_map(|slot| slot.get()).collect();

        let collect_table = |table: SectorId, sectors: &mut Vec<SectorId>| {
            sectors.push(table);
            cache.map(table, 0, |indirect1: &IndirectBlock| {
                sectors.extend(indirect1.iter().filter_map(|slot| slot.get()));
            });
        };

        if let Some(table) = self.single_indirect() {
            collect_table(table, &mut sectors);
        }

        if let Some(table) = self.double_indirect() {
            sectors.push(table);
            let indirect2: IndirectBlock = cache.map(table, 0, |indirect2: &IndirectBlock| *indirect2);
            for child in indirect2.iter().filter_map(|slot| slot.get()) {
                collect_table(child, &mut sectors);
            }
        }

        sectors
    }

    /// 计算容纳指定数据量需要多少个**数据块**
    #[inline]
    pub fn count_data_block(size: usize) -> usize {
        size.div_ceil(SECTOR_SIZE)
    }

    /// 计算 `data_blocks` 个数据块需要多少个 **数据块** 和 **索引块**(`IndirectBlock`)
    pub fn count_total_block(data_blocks: usize) -> usize {
        let mut total = data_blocks;

        // 超出直接索引，使用一级索引块
        if data_blocks > DIRECT_CAP {
            total += 1;
        }

        // 超出一级索引，使用二级索引块及其下的一级索引块
        if data_blocks > INDIRECT1_CAP {
            total += 1 + (data_blocks - INDIRECT1_CAP).div_ceil(INDIRECT1_COUNT);
        }

        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_fits_one_sector() {
        assert_eq!(mem::size_of::<DiskInode>(), 512);
        assert_eq!(INDIRECT_COUNT, 128);
        assert_eq!(INDIRECT1_CAP, 250);
        assert_eq!(MAX_FILE_BLOCKS, 122 + 128 + 128 * 128);
    }

    #[test]
    fn locate_boundaries() {
        assert_eq!(locate(0), Some(BlockPath::Direct(0)));
        assert_eq!(locate(121), Some(BlockPath::Direct(121)));
        assert_eq!(locate(122), Some(BlockPath::Single(0)));
        assert_eq!(locate(249), Some(BlockPath::Single(127)));
        assert_eq!(locate(250), Some(BlockPath::Double(0, 0)));
        assert_eq!(locate(250 + 127), Some(BlockPath::Double(0, 127)));
        assert_eq!(locate(250 + 128), Some(BlockPath::Double(1, 0)));
        assert_eq!(locate(MAX_FILE_BLOCKS - 1), Some(BlockPath::Double(127, 127)));
        assert_eq!(locate(MAX_FILE_BLOCKS), None);
    }

    #[test]
    fn total_block_counts() {
        assert_eq!(DiskInode::count_total_block(0), 0);
        assert_eq!(DiskInode::count_total_block(122), 122);
        // 一个一级索引块
        assert_eq!(DiskInode::count_total_block(123), 124);
        assert_eq!(DiskInode::count_total_block(250), 251);
        // 一级索引块 + 二级索引块 + 一个子索引块
        assert_eq!(DiskInode::count_total_block(251), 254);
        assert_eq!(DiskInode::count_total_block(250 + 129), 250 + 129 + 1 + 1 + 2);
    }

    #[test]
    fn fresh_inode_is_unmapped() {
        let inode = DiskInode::new(0, DiskInodeKind::Directory, SectorId::new(1));
        assert!(inode.is_valid());
        assert!(inode.is_dir());
        assert!(inode.is_unmapped());
        assert_eq!(inode.direct(0), None);
        assert_eq!(inode.single_indirect(), None);
    }

    #[test]
    fn data_block_count() {
        assert_eq!(DiskInode::count_data_block(0), 0);
        assert_eq!(DiskInode::count_data_block(1), 1);
        assert_eq!(DiskInode::count_data_block(512), 1);
        assert_eq!(DiskInode::count_data_block(513), 2);
    }
}
