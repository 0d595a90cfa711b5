//! # 块缓存层
//!
//! 块设备读写速度一般慢于内存读写速度，因此我们在内存中开辟固定数量的扇区槽位，
//! 把即将操作的扇区复制到槽位中，其它各层对扇区的读写都经过块缓存层。
//!
//! 整个缓存池由一把锁保护，每次调用即一个临界区（换出时的写回也在锁内）。
//! 缓存不下时按时钟（二次机会）算法挑选换出的槽位。
//!
//! 脏槽位只在被换出或 [`BufferCache::flush_all`] 时写回。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;

use block_dev::BlockDevice;
use enumflags2::{bitflags, BitFlags};
use spin::Mutex;

use crate::sector::SectorId;
use crate::{DataBlock, SECTOR_SIZE};

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotFlag {
    /// 槽位缓存着某个扇区
    Valid = 0b001,
    /// 内存中的数据比磁盘新
    Dirty = 0b010,
    /// 自时钟指针上次经过后被访问过
    Accessed = 0b100,
}

/// 对齐的扇区数据，好让磁盘数据结构能直接映射在上面
#[derive(Clone)]
#[repr(C, align(8))]
struct SectorBuf(DataBlock);

/// 缓存槽位
struct Slot {
    sector: Option<SectorId>,
    data: SectorBuf,
    flags: BitFlags<SlotFlag>,
}

impl Slot {
    const fn empty() -> Self {
        Self {
            sector: None,
            data: SectorBuf([0; SECTOR_SIZE]),
            flags: BitFlags::EMPTY,
        }
    }

    #[inline]
    fn is_valid(&self) -> bool {
        self.flags.contains(SlotFlag::Valid)
    }

    fn write_back(&mut self, device: &dyn BlockDevice) {
        match self.sector {
            Some(sector) if self.flags.contains(SlotFlag::Valid | SlotFlag::Dirty) => {
                device.write_block(sector.index(), &self.data.0);
                self.flags.remove(SlotFlag::Dirty);
            }
            _ => (),
        }
    }

    fn get<T: Sized>(&self, offset: usize) -> &T {
        Self::check::<T>(offset);
        let addr = self.data.0[offset..].as_ptr().cast::<T>();
        unsafe { &*addr }
    }

    fn get_mut<T: Sized>(&mut self, offset: usize) -> &mut T {
        Self::check::<T>(offset);
        self.flags.insert(SlotFlag::Dirty);
        let addr = self.data.0[offset..].as_mut_ptr().cast::<T>();
        unsafe { &mut *addr }
    }

    #[inline]
    fn check<T>(offset: usize) {
        assert!(mem::size_of::<T>() + offset <= SECTOR_SIZE);
        assert_eq!(offset % mem::align_of::<T>(), 0);
    }
}

/// 槽位池与时钟指针
struct CachePool {
    slots: Vec<Slot>,
    hand: usize,
}

impl CachePool {
    /// 找到缓存着 `sector` 的槽位，其次是第一个空槽位
    fn find(&self, sector: SectorId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.is_valid() && slot.sector == Some(sector))
            .or_else(|| self.slots.iter().position(|slot| !slot.is_valid()))
    }

    /// 时钟算法：访问位为1的清零后跳过，遇到访问位为0的即换出
    fn evict(&mut self, device: &dyn BlockDevice) -> usize {
        let len = self.slots.len();
        loop {
            let hand = self.hand;
            self.hand = (hand + 1) % len;
            let slot = &mut self.slots[hand];

            if slot.flags.contains(SlotFlag::Accessed) {
                slot.flags.remove(SlotFlag::Accessed);
                continue;
            }

            log::trace!("evict sector {:?} from slot {hand}", slot.sector);
            slot.write_back(device);
            slot.flags = BitFlags::EMPTY;
            slot.sector = None;
            return hand;
        }
    }

    /// 取得缓存着 `sector` 的槽位，必要时换出并从磁盘读入整个扇区
    fn fetch(&mut self, sector: SectorId, device: &dyn BlockDevice) -> &mut Slot {
        let index = match self.find(sector) {
            Some(index) => index,
            None => self.evict(device),
        };

        let slot = &mut self.slots[index];
        if !slot.is_valid() {
            device.read_block(sector.index(), &mut slot.data.0);
            slot.sector = Some(sector);
            slot.flags = SlotFlag::Valid.into();
        }
        slot.flags.insert(SlotFlag::Accessed);

        slot
    }
}

/// 扇区缓存
pub struct BufferCache {
    /// 底层块设备的引用
    device: Arc<dyn BlockDevice>,
    pool: Mutex<CachePool>,
}

impl BufferCache {
    pub fn new(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            device,
            pool: Mutex::new(CachePool {
                slots: (0..capacity).map(|_| Slot::empty()).collect(),
                hand: 0,
            }),
        }
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// 从扇区 `sector` 的 `offset` 处读出 `buf.len()` 字节
    pub fn read(&self, sector: SectorId, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= SECTOR_SIZE);
        let mut pool = self.pool.lock();
        let slot = pool.fetch(sector, self.device.as_ref());
        buf.copy_from_slice(&slot.data.0[offset..offset + buf.len()]);
    }

    /// 把 `data` 写到扇区 `sector` 的 `offset` 处，其余字节保持不变
    pub fn write(&self, sector: SectorId, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= SECTOR_SIZE);
        let mut pool = self.pool.lock();
        let slot = pool.fetch(sector, self.device.as_ref());
        slot.data.0[offset..offset + data.len()].copy_from_slice(data);
        slot.flags.insert(SlotFlag::Dirty);
    }

    /// 以磁盘数据结构 `T` 的视角读取扇区，闭包内不能再访问缓存
    pub fn map<T: Sized, V>(&self, sector: SectorId, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        let mut pool = self.pool.lock();
        f(pool.fetch(sector, self.device.as_ref()).get(offset))
    }

    /// 以磁盘数据结构 `T` 的视角修改扇区，闭包内不能再访问缓存
    pub fn map_mut<T: Sized, V>(
        &self,
        sector: SectorId,
        offset: usize,
        f: impl FnOnce(&mut T) -> V,
    ) -> V {
        let mut pool = self.pool.lock();
        f(pool.fetch(sector, self.device.as_ref()).get_mut(offset))
    }

    #[inline]
    pub fn zeroize(&self, sector: SectorId) {
        self.write(sector, 0, &[0; SECTOR_SIZE]);
    }

    /// 丢弃扇区的缓存，不写回
    pub fn invalidate(&self, sector: SectorId) {
        let mut pool = self.pool.lock();
        if let Some(slot) = pool
            .slots
            .iter_mut()
            .find(|slot| slot.is_valid() && slot.sector == Some(sector))
        {
            slot.flags = BitFlags::EMPTY;
            slot.sector = None;
        }
    }

    /// 写回所有脏槽位
    pub fn flush_all(&self) {
        let mut pool = self.pool.lock();
        for slot in pool.slots.iter_mut() {
            slot.write_back(self.device.as_ref());
        }
    }

    /// 当前被缓存的扇区
    #[cfg(test)]
    pub fn cached_sectors(&self) -> Vec<SectorId> {
        self.pool
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.is_valid())
            .filter_map(|slot| slot.sector)
            .collect()
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        self.flush_all();
    }
}
