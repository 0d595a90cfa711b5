//! # 索引节点层
//!
//! 打开的 inode 登记在卷的 inode 表里，同一扇区只有一个表项，
//! 所有 [`Inode`] 句柄共享它。克隆句柄即重新打开，丢弃句柄即关闭。
//!
//! 被删除的 inode 在最后一次关闭时才回收其扇区，
//! 在此之前已打开的句柄照常读写。

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;
use vfs::{DirEntryType, Stat};

use crate::block_cache::BufferCache;
use crate::free_map::FreeMap;
use crate::layout::{DiskInode, DiskInodeKind};
use crate::sector::SectorId;
use crate::{Error, Result, SECTOR_SIZE};

/// 一个挂载的卷：块缓存、空闲位图与打开的 inode 表
pub(crate) struct Volume {
    pub(crate) cache: BufferCache,
    pub(crate) free_map: FreeMap,
    open_inodes: Mutex<BTreeMap<SectorId, OpenInode>>,
}

struct OpenInode {
    open_cnt: usize,
    shared: Arc<InodeShared>,
}

struct InodeShared {
    sector: SectorId,
    state: Mutex<InodeState>,
}

struct InodeState {
    /// 与缓存中的记录保持一致，每次修改都立即写回缓存
    disk: DiskInode,
    removed: bool,
    deny_write_cnt: usize,
}

impl Volume {
    pub(crate) fn new(cache: BufferCache, free_map: FreeMap) -> Self {
        Self {
            cache,
            free_map,
            open_inodes: Mutex::new(BTreeMap::new()),
        }
    }

    /// 当前打开着的 inode
    pub(crate) fn open_sectors(&self) -> Vec<SectorId> {
        self.open_inodes.lock().keys().copied().collect()
    }

    /// 归还 inode 占用的全部扇区
    fn reclaim(&self, sector: SectorId, disk_inode: &DiskInode) {
        let mut sectors = disk_inode.owned_sectors(&self.cache);
        sectors.push(sector);
        sectors.sort_unstable();

        // 合并成连续的区间再归还
        let mut runs: Vec<(SectorId, usize)> = Vec::new();
        for sector in sectors {
            match runs.last_mut() {
                Some((start, count)) if *start + *count as u32 == sector => *count += 1,
                _ => runs.push((sector, 1)),
            }
        }
        for (start, count) in runs {
            self.free_map.release(start, count, &self.cache);
        }

        self.cache.invalidate(sector);
        log::debug!("inode {sector} reclaimed");
    }
}

/// 打开的 inode 句柄
pub struct Inode {
    shared: Arc<InodeShared>,
    volume: Arc<Volume>,
}

impl Inode {
    /// 在扇区 `sector` 上写一个新的 inode，并分配 `length` 字节的数据块。
    /// 扇区不足时返回 false，已消耗的扇区不回滚。
    pub(crate) fn create(
        volume: &Volume,
        sector: SectorId,
        length: usize,
        kind: DiskInodeKind,
        parent: SectorId,
    ) -> bool {
        let mut disk_inode = DiskInode::new(length as u32, kind, parent);
        if !volume.free_map.allocate_extent(
            DiskInode::count_data_block(length),
            &mut disk_inode,
            &volume.cache,
        ) {
            return false;
        }

        volume
            .cache
            .map_mut(sector, 0, |record: &mut DiskInode| *record = disk_inode);
        true
    }

    pub(crate) fn open(volume: &Arc<Volume>, sector: SectorId) -> Result<Self> {
        let mut table = volume.open_inodes.lock();

        if let Some(entry) = table.get_mut(&sector) {
            entry.open_cnt += 1;
            return Ok(Self {
                shared: entry.shared.clone(),
                volume: volume.clone(),
            });
        }

        let disk = volume.cache.map(sector, 0, |record: &DiskInode| record.clone());
        if !disk.is_valid() {
            log::error!("sector {sector} does not hold a valid inode");
            return Err(Error::Corrupted);
        }

        let shared = Arc::new(InodeShared {
            sector,
            state: Mutex::new(InodeState {
                disk,
                removed: false,
                deny_write_cnt: 0,
            }),
        });
        table.insert(
            sector,
            OpenInode {
                open_cnt: 1,
                shared: shared.clone(),
            },
        );

        Ok(Self {
            shared,
            volume: volume.clone(),
        })
    }

    #[inline]
    pub(crate) fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    /// inode 所在扇区，也是它的 inode 编号
    #[inline]
    pub fn sector(&self) -> SectorId {
        self.shared.sector
    }

    /// 创建它的目录所在扇区
    pub fn parent(&self) -> SectorId {
        self.shared.state.lock().disk.parent
    }

    pub fn is_dir(&self) -> bool {
        self.shared.state.lock().disk.is_dir()
    }

    pub fn length(&self) -> usize {
        self.shared.state.lock().disk.length as usize
    }

    pub fn is_removed(&self) -> bool {
        self.shared.state.lock().removed
    }

    /// 标记删除，最后一次关闭时回收
    pub fn remove(&self) {
        self.shared.state.lock().removed = true;
    }

    pub fn open_count(&self) -> usize {
        self.volume
            .open_inodes
            .lock()
            .get(&self.sector())
            .map_or(0, |entry| entry.open_cnt)
    }

    /// 块映射占用的全部扇区，不含 inode 自身
    pub(crate) fn owned_sectors(&self) -> Vec<SectorId> {
        let state = self.shared.state.lock();
        state.disk.owned_sectors(&self.volume.cache)
    }

    /// 从 `offset` 处读出至多 `buf.len()` 字节，返回实际读出的字节数
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let state = self.shared.state.lock();
        let cache = &self.volume.cache;

        let end = offset.saturating_add(buf.len()).min(state.disk.length as usize);
        if offset >= end {
            return 0;
        }

        let mut start = offset;
        // 已读取多少字节
        let mut read_size = 0;
        while start < end {
            // 当前块的逻辑索引
            let block_index = start / SECTOR_SIZE;
            // 当前块的末地址(字节)
            let current_block_end = ((block_index + 1) * SECTOR_SIZE).min(end);
            let block_read_size = current_block_end - start;
            let dest = &mut buf[read_size..read_size + block_read_size];

            match state.disk.block_id(block_index, cache) {
                Some(sector) => cache.read(sector, start % SECTOR_SIZE, dest),
                None => break,
            }

            read_size += block_read_size;
            start = current_block_end;
        }

        read_size
    }

    /// 从 `offset` 处写入 `buf`，超出文件末尾时先扩展。
    /// 返回实际写入的字节数；禁止写入或扩展失败时为0。
    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        let mut state = self.shared.state.lock();
        let cache = &self.volume.cache;

        if state.deny_write_cnt > 0 || buf.is_empty() {
            return 0;
        }

        let Some(end) = offset.checked_add(buf.len()) else {
            return 0;
        };
        if end > state.disk.length as usize {
            let blocks = DiskInode::count_data_block(end);
            if !self.volume.free_map.grow_extent(blocks, &mut state.disk, cache) {
                log::warn!("inode {} cannot grow to {end} bytes", self.sector());
                return 0;
            }
            state.disk.length = end as u32;
            let disk = state.disk.clone();
            cache.map_mut(self.sector(), 0, |record: &mut DiskInode| *record = disk);
        }

        let mut start = offset;
        // 已写入多少字节
        let mut write_size = 0;
        while start < end {
            let block_index = start / SECTOR_SIZE;
            let current_block_end = ((block_index + 1) * SECTOR_SIZE).min(end);
            let block_write_size = current_block_end - start;
            let src = &buf[write_size..write_size + block_write_size];

            match state.disk.block_id(block_index, cache) {
                Some(sector) => cache.write(sector, start % SECTOR_SIZE, src),
                None => break,
            }

            write_size += block_write_size;
            start = current_block_end;
        }

        write_size
    }

    /// 禁止写入，每个打开者至多调用一次
    pub fn deny_write(&self) {
        let mut state = self.shared.state.lock();
        state.deny_write_cnt += 1;
    }

    /// 撤销一次 [`Inode::deny_write`]
    pub fn allow_write(&self) {
        let mut state = self.shared.state.lock();
        assert!(state.deny_write_cnt > 0, "unbalanced allow_write");
        state.deny_write_cnt -= 1;
    }

    pub fn stat(&self) -> Stat {
        let state = self.shared.state.lock();
        let length = state.disk.length as usize;

        Stat {
            ino: self.sector().raw() as u64,
            mode: if state.disk.is_dir() {
                DirEntryType::Directory
            } else {
                DirEntryType::Regular
            },
            block_size: SECTOR_SIZE as u64,
            blocks: DiskInode::count_total_block(DiskInode::count_data_block(length)) as u64,
            size: length as u64,
        }
    }
}

impl Clone for Inode {
    fn clone(&self) -> Self {
        let mut table = self.volume.open_inodes.lock();
        if let Some(entry) = table.get_mut(&self.sector()) {
            entry.open_cnt += 1;
        }

        Self {
            shared: self.shared.clone(),
            volume: self.volume.clone(),
        }
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        let sector = self.sector();
        let mut table = self.volume.open_inodes.lock();

        let Some(entry) = table.get_mut(&sector) else {
            return;
        };
        entry.open_cnt -= 1;
        if entry.open_cnt > 0 {
            return;
        }
        table.remove(&sector);

        let state = self.shared.state.lock();
        if state.removed {
            self.volume.reclaim(sector, &state.disk);
        }
    }
}

impl core::fmt::Debug for Inode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Inode")
            .field("sector", &self.sector())
            .finish_non_exhaustive()
    }
}
