//! # 空闲扇区管理
//!
//! 位图常驻内存，由一把锁保护；每次成功修改后立即写进位图文件
//! （扇区0处 inode 的数据块）再返回。
//!
//! 块映射按需分配：扩展时只填补为空的槽位，已分配的块原封不动。
//! 所需扇区不足时直接失败，不动位图。

use alloc::vec::Vec;

use spin::Mutex;

use crate::block_cache::BufferCache;
use crate::layout::{
    Bitmap, DiskInode, IndirectBlock, DIRECT_COUNT, EMPTY_INDIRECT, INDIRECT1_CAP,
    INDIRECT_COUNT, MAX_FILE_BLOCKS,
};
use crate::sector::SectorId;
use crate::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR, SECTOR_SIZE};

pub struct FreeMap {
    inner: Mutex<FreeMapInner>,
}

struct FreeMapInner {
    bitmap: Bitmap,
    /// 位图文件的数据扇区；格式化途中位图文件尚未建成时为空
    backing: Vec<SectorId>,
}

impl FreeMap {
    /// 全新的位图，只有两个保留扇区已分配
    pub fn new(sectors: usize) -> Self {
        let mut bitmap = Bitmap::new(sectors);
        bitmap.set(FREE_MAP_SECTOR.index(), true);
        bitmap.set(ROOT_DIR_SECTOR.index(), true);

        Self {
            inner: Mutex::new(FreeMapInner {
                bitmap,
                backing: Vec::new(),
            }),
        }
    }

    /// 从位图文件的数据扇区读出位图
    pub fn load(sectors: usize, backing: Vec<SectorId>, cache: &BufferCache) -> Option<Self> {
        let mut bytes = alloc::vec![0; backing.len() * SECTOR_SIZE];
        for (chunk, &sector) in bytes.chunks_exact_mut(SECTOR_SIZE).zip(&backing) {
            cache.read(sector, 0, chunk);
        }
        let bitmap = Bitmap::load(sectors, &bytes)?;

        Some(Self {
            inner: Mutex::new(FreeMapInner { bitmap, backing }),
        })
    }

    /// 位图文件的字节长度
    #[inline]
    pub fn file_len(sectors: usize) -> usize {
        Bitmap::byte_len(sectors)
    }

    /// 位图文件建成后绑定其数据扇区，并首次落盘
    pub fn attach(&self, backing: Vec<SectorId>, cache: &BufferCache) {
        let mut inner = self.inner.lock();
        inner.backing = backing;
        inner.persist(cache);
    }

    pub fn allocate_one(&self, cache: &BufferCache) -> Option<SectorId> {
        let mut inner = self.inner.lock();
        let sector = inner.take()?;
        inner.persist(cache);
        log::trace!("allocate sector {sector}");
        Some(sector)
    }

    /// 为全新的 inode 分配 `count` 个数据块及所需的索引块
    pub fn allocate_extent(&self, count: usize, disk_inode: &mut DiskInode, cache: &BufferCache) -> bool {
        debug_assert!(disk_inode.is_unmapped());
        self.grow_extent(count, disk_inode, cache)
    }

    /// 把 inode 的块映射扩展到 `new_count` 个数据块，不改动已分配的槽位
    pub fn grow_extent(&self, new_count: usize, disk_inode: &mut DiskInode, cache: &BufferCache) -> bool {
        if new_count > MAX_FILE_BLOCKS {
            log::warn!("{new_count} blocks exceed the maximum file size");
            return false;
        }

        let mut inner = self.inner.lock();
        let missing = missing_sectors(disk_inode, new_count, cache);
        if missing > inner.bitmap.count_free() {
            log::warn!(
                "need {missing} sectors but only {} are free",
                inner.bitmap.count_free()
            );
            return false;
        }
        if missing == 0 {
            return true;
        }

        let filled = inner.fill(disk_inode, new_count, cache).is_some();
        inner.persist(cache);
        log::trace!("extent grown to {new_count} blocks with {missing} new sectors");
        filled
    }

    /// 归还 `[sector, sector+count)`，这些扇区必须都已分配
    pub fn release(&self, sector: SectorId, count: usize, cache: &BufferCache) {
        let mut inner = self.inner.lock();
        assert!(
            inner.bitmap.all(sector.index(), count),
            "releasing unallocated sectors {sector}+{count}"
        );
        inner.bitmap.set_range(sector.index(), count, false);
        inner.persist(cache);
        log::trace!("release sectors {sector}+{count}");
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().bitmap.count_free()
    }

    /// 超出设备范围的扇区视为未分配
    pub fn is_allocated(&self, sector: SectorId) -> bool {
        let inner = self.inner.lock();
        sector.index() < inner.bitmap.len() && inner.bitmap.test(sector.index())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().bitmap.len()
    }
}

impl FreeMapInner {
    #[inline]
    fn take(&mut self) -> Option<SectorId> {
        self.bitmap
            .scan_and_flip()
            .map(|index| SectorId::new(index as u32))
    }

    /// 写入位图文件；没有绑定数据扇区时什么也不做
    fn persist(&self, cache: &BufferCache) {
        let bytes = self.bitmap.to_bytes();
        for (chunk, &sector) in bytes.chunks(SECTOR_SIZE).zip(&self.backing) {
            cache.write(sector, 0, chunk);
        }
    }

    /// 分配并清零一个数据块
    fn take_data(&mut self, cache: &BufferCache) -> Option<SectorId> {
        let sector = self.take()?;
        cache.zeroize(sector);
        Some(sector)
    }

    /// 分配一个全空的索引块
    fn take_table(&mut self, cache: &BufferCache) -> Option<SectorId> {
        let sector = self.take()?;
        cache.map_mut(sector, 0, |table: &mut IndirectBlock| *table = EMPTY_INDIRECT);
        Some(sector)
    }

    /// 填补一级索引块的前 `want` 项中为空的项
    fn fill_table(&mut self, table: SectorId, want: usize, cache: &BufferCache) -> Option<()> {
        let mut indirect1: IndirectBlock = cache.map(table, 0, |indirect1: &IndirectBlock| *indirect1);

        let mut filled = Some(());
        for slot in indirect1[..want].iter_mut().filter(|slot| slot.is_empty()) {
            match self.take_data(cache) {
                Some(sector) => slot.set(Some(sector)),
                None => {
                    filled = None;
                    break;
                }
            }
        }

        cache.map_mut(table, 0, |table: &mut IndirectBlock| *table = indirect1);
        filled
    }

    fn fill(&mut self, disk_inode: &mut DiskInode, count: usize, cache: &BufferCache) -> Option<()> {
        /******************** 直接索引 ********************/
        for index in 0..count.min(DIRECT_COUNT) {
            if disk_inode.direct(index).is_none() {
                disk_inode.set_direct(index, Some(self.take_data(cache)?));
            }
        }
        /******************** END ********************/

        if count <= DIRECT_COUNT {
            return Some(());
        }

        /******************** 一级索引 ********************/
        let single = match disk_inode.single_indirect() {
            Some(table) => table,
            None => {
                let table = self.take_table(cache)?;
                disk_inode.set_single_indirect(Some(table));
                table
            }
        };
        self.fill_table(single, (count - DIRECT_COUNT).min(INDIRECT_COUNT), cache)?;
        /******************** END ********************/

        if count <= INDIRECT1_CAP {
            return Some(());
        }

        /******************** 二级索引 ********************/
        let double = match disk_inode.double_indirect() {
            Some(table) => table,
            None => {
                let table = self.take_table(cache)?;
                disk_inode.set_double_indirect(Some(table));
                table
            }
        };

        let wanted = count - INDIRECT1_CAP;
        let children = wanted.div_ceil(INDIRECT_COUNT);
        let mut indirect2: IndirectBlock = cache.map(double, 0, |indirect2: &IndirectBlock| *indirect2);

        // 之前的子块都已填满，从第一个未填满的子块开始
        let first = first_unfilled_child(&indirect2, cache);
        let mut filled = Some(());
        for index in first..children {
            let want = (wanted - index * INDIRECT_COUNT).min(INDIRECT_COUNT);
            let child = match indirect2[index].get() {
                Some(child) => child,
                None => match self.take_table(cache) {
                    Some(child) => {
                        indirect2[index].set(Some(child));
                        child
                    }
                    None => {
                        filled = None;
                        break;
                    }
                },
            };
            if self.fill_table(child, want, cache).is_none() {
                filled = None;
                break;
            }
        }

        cache.map_mut(double, 0, |table: &mut IndirectBlock| *table = indirect2);
        /******************** END ********************/

        filled
    }
}

/// 二级索引块中第一个未填满的子块：
/// 最后一个已分配的子块若还有空项就是它，否则是第一个空项
fn first_unfilled_child(indirect2: &IndirectBlock, cache: &BufferCache) -> usize {
    let allocated = indirect2
        .iter()
        .position(|slot| slot.is_empty())
        .unwrap_or(INDIRECT_COUNT);

    match allocated.checked_sub(1).and_then(|last| indirect2[last].get().map(|child| (last, child))) {
        Some((last, child))
            if cache.map(child, 0, |indirect1: &IndirectBlock| {
                indirect1.iter().any(|slot| slot.is_empty())
            }) =>
        {
            last
        }
        _ => allocated,
    }
}

/// 统计把块映射扩展到 `count` 个数据块还缺多少扇区（数据块与索引块）
fn missing_sectors(disk_inode: &DiskInode, count: usize, cache: &BufferCache) -> usize {
    let empty_in = |table: SectorId, want: usize| {
        cache.map(table, 0, |indirect1: &IndirectBlock| {
            indirect1[..want].iter().filter(|slot| slot.is_empty()).count()
        })
    };

    let mut missing = (0..count.min(DIRECT_COUNT))
        .filter(|&index| disk_inode.direct(index).is_none())
        .count();

    if count > DIRECT_COUNT {
        let want = (count - DIRECT_COUNT).min(INDIRECT_COUNT);
        missing += match disk_inode.single_indirect() {
            Some(table) => empty_in(table, want),
            None => 1 + want,
        };
    }

    if count > INDIRECT1_CAP {
        let wanted = count - INDIRECT1_CAP;
        let children = wanted.div_ceil(INDIRECT_COUNT);
        let indirect2 = disk_inode
            .double_indirect()
            .map(|table| cache.map(table, 0, |indirect2: &IndirectBlock| *indirect2));
        if indirect2.is_none() {
            missing += 1;
        }

        for index in 0..children {
            let want = (wanted - index * INDIRECT_COUNT).min(INDIRECT_COUNT);
            missing += match indirect2.and_then(|indirect2| indirect2[index].get()) {
                Some(child) => empty_in(child, want),
                None => 1 + want,
            };
        }
    }

    missing
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use block_dev::RamDisk;

    use super::*;
    use crate::layout::DiskInodeKind;
    use crate::CACHE_CAPACITY;

    fn setup(sectors: usize) -> (BufferCache, FreeMap) {
        let cache = BufferCache::new(Arc::new(RamDisk::new(sectors)), CACHE_CAPACITY);
        (cache, FreeMap::new(sectors))
    }

    fn inode() -> DiskInode {
        DiskInode::new(0, DiskInodeKind::File, ROOT_DIR_SECTOR)
    }

    /// 分配 `count` 块后实际占用的扇区数
    fn consumed(count: usize) -> usize {
        let (cache, free_map) = setup(20_000);
        let before = free_map.free_count();
        let mut disk_inode = inode();
        assert!(free_map.allocate_extent(count, &mut disk_inode, &cache));
        before - free_map.free_count()
    }

    #[test]
    fn reserved_sectors() {
        let (cache, free_map) = setup(16);
        assert!(free_map.is_allocated(FREE_MAP_SECTOR));
        assert!(free_map.is_allocated(ROOT_DIR_SECTOR));
        assert_eq!(free_map.allocate_one(&cache), Some(SectorId::new(2)));
        assert_eq!(free_map.free_count(), 13);
    }

    #[test]
    fn extent_regimes() {
        // 只用直接索引
        assert_eq!(consumed(122), 122);
        // 一个一级索引块 + 一个数据块
        assert_eq!(consumed(123), 122 + 1 + 1);
        assert_eq!(consumed(250), 250 + 1);
        // 二级索引块 + 一个子块 + 一个数据块
        assert_eq!(consumed(251), 250 + 1 + 1 + 1 + 1);
    }

    #[test]
    fn single_indirect_sentinels() {
        let (cache, free_map) = setup(1024);
        let mut disk_inode = inode();
        assert!(free_map.allocate_extent(123, &mut disk_inode, &cache));

        let table = disk_inode.single_indirect().unwrap();
        let indirect1: IndirectBlock = cache.map(table, 0, |t: &IndirectBlock| *t);
        assert!(indirect1[0].get().is_some());
        assert!(indirect1[1..].iter().all(|slot| slot.is_empty()));
        assert_eq!(disk_inode.double_indirect(), None);
        assert_eq!(disk_inode.owned_sectors(&cache).len(), 124);
    }

    #[test]
    fn double_indirect_partial_child() {
        let (cache, free_map) = setup(1024);
        let mut disk_inode = inode();
        assert!(free_map.allocate_extent(251, &mut disk_inode, &cache));

        let double = disk_inode.double_indirect().unwrap();
        let indirect2: IndirectBlock = cache.map(double, 0, |t: &IndirectBlock| *t);
        assert!(indirect2[1..].iter().all(|slot| slot.is_empty()));

        let child = indirect2[0].get().unwrap();
        let indirect1: IndirectBlock = cache.map(child, 0, |t: &IndirectBlock| *t);
        assert!(indirect1[0].get().is_some());
        assert!(indirect1[1..].iter().all(|slot| slot.is_empty()));
    }

    #[test]
    fn growth_keeps_allocated_blocks() {
        let (cache, free_map) = setup(2048);
        let mut disk_inode = inode();

        let mut previous = Vec::new();
        for count in [1, 122, 123, 250, 251, 300, 378, 379, 600] {
            assert!(free_map.grow_extent(count, &mut disk_inode, &cache));
            let sectors = disk_inode.data_sectors(count, &cache);
            assert_eq!(sectors.len(), count);
            assert_eq!(&sectors[..previous.len()], &previous[..]);
            assert_eq!(
                disk_inode.owned_sectors(&cache).len(),
                DiskInode::count_total_block(count)
            );
            previous = sectors;
        }
    }

    #[test]
    fn growth_equals_fresh_allocation() {
        for (from, to) in [(0, 251), (100, 251), (250, 251), (251, 379), (260, 2000)] {
            let (cache, free_map) = setup(4096);
            let mut disk_inode = inode();
            assert!(free_map.grow_extent(from, &mut disk_inode, &cache));
            let before = free_map.free_count();
            assert!(free_map.grow_extent(to, &mut disk_inode, &cache));

            assert_eq!(
                before - free_map.free_count(),
                DiskInode::count_total_block(to) - DiskInode::count_total_block(from)
            );
        }
    }

    #[test]
    fn first_unfilled_child_scan() {
        let (cache, free_map) = setup(2048);
        let mut disk_inode = inode();

        // 第一个子块刚好填满
        assert!(free_map.grow_extent(250 + 128, &mut disk_inode, &cache));
        let double = disk_inode.double_indirect().unwrap();
        let indirect2: IndirectBlock = cache.map(double, 0, |t: &IndirectBlock| *t);
        assert_eq!(first_unfilled_child(&indirect2, &cache), 1);

        // 第二个子块只用了一项
        assert!(free_map.grow_extent(250 + 129, &mut disk_inode, &cache));
        let indirect2: IndirectBlock = cache.map(double, 0, |t: &IndirectBlock| *t);
        assert_eq!(first_unfilled_child(&indirect2, &cache), 1);

        assert_eq!(first_unfilled_child(&EMPTY_INDIRECT, &cache), 0);
    }

    #[test]
    fn exhaustion_leaves_bitmap_untouched() {
        let (cache, free_map) = setup(64);
        let mut disk_inode = inode();
        let free = free_map.free_count();

        assert!(!free_map.allocate_extent(100, &mut disk_inode, &cache));
        assert_eq!(free_map.free_count(), free);
        assert!(disk_inode.is_unmapped());

        assert!(!free_map.grow_extent(MAX_FILE_BLOCKS + 1, &mut disk_inode, &cache));
    }

    #[test]
    fn release_returns_sectors() {
        let (cache, free_map) = setup(64);
        let first = free_map.allocate_one(&cache).unwrap();
        let second = free_map.allocate_one(&cache).unwrap();
        assert_eq!(second, first + 1);

        free_map.release(first, 2, &cache);
        assert!(!free_map.is_allocated(first));
        assert!(!free_map.is_allocated(second));
        assert_eq!(free_map.allocate_one(&cache), Some(first));
    }

    #[test]
    #[should_panic]
    fn release_unallocated_is_fatal() {
        let (cache, free_map) = setup(64);
        free_map.release(SectorId::new(10), 1, &cache);
    }

    #[test]
    fn persisted_bitmap_reloads() {
        let (cache, free_map) = setup(4096);
        let mut backing_inode = inode();
        let len = FreeMap::file_len(4096);
        assert!(free_map.allocate_extent(DiskInode::count_data_block(len), &mut backing_inode, &cache));
        let backing = backing_inode.data_sectors(DiskInode::count_data_block(len), &cache);
        free_map.attach(backing.clone(), &cache);

        let mut disk_inode = inode();
        assert!(free_map.allocate_extent(300, &mut disk_inode, &cache));

        let loaded = FreeMap::load(4096, backing, &cache).unwrap();
        assert_eq!(loaded.free_count(), free_map.free_count());
        for sector in disk_inode.owned_sectors(&cache) {
            assert!(loaded.is_allocated(sector));
        }
    }
}
