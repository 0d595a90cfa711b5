//! # 文件系统门面
//!
//! 磁盘布局的建立（格式化）与读取（挂载），以及按路径的创建、打开、删除。
//! 相对路径从调用者的 [`WorkingDir`] 出发。

use alloc::sync::Arc;
use alloc::vec::Vec;

use block_dev::BlockDevice;

use crate::block_cache::BufferCache;
use crate::directory::{resolve_path, Dir};
use crate::file::File;
use crate::free_map::FreeMap;
use crate::fsck::{self, Report};
use crate::inode::{Inode, Volume};
use crate::layout::{DirEntry, DiskInode, DiskInodeKind};
use crate::sector::SectorId;
use crate::{
    Error, Result, CACHE_CAPACITY, FREE_MAP_SECTOR, ROOT_DIR_ENTRIES, ROOT_DIR_SECTOR,
};

pub struct FileSystem {
    pub(crate) volume: Arc<Volume>,
}

/// 进程的工作目录，没有打开任何目录时即根目录
#[derive(Debug, Default)]
pub struct WorkingDir {
    dir: Option<Dir>,
}

impl WorkingDir {
    #[inline]
    pub fn root() -> Self {
        Self::default()
    }

    #[inline]
    pub fn dir(&self) -> Option<&Dir> {
        self.dir.as_ref()
    }

    /// 工作目录 inode 所在扇区
    pub fn sector(&self) -> SectorId {
        self.dir
            .as_ref()
            .map_or(ROOT_DIR_SECTOR, |dir| dir.inode().sector())
    }
}

impl FileSystem {
    /// 在设备上建立全新的文件系统
    pub fn format(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let sectors = device.num_blocks();
        // 两个保留扇区之外至少还要放得下位图文件
        if sectors <= ROOT_DIR_SECTOR.index() + 1 {
            return Err(Error::NoSpace);
        }

        let cache = BufferCache::new(device, CACHE_CAPACITY);
        let volume = Arc::new(Volume::new(cache, FreeMap::new(sectors)));

        // 位图文件建成前，位图的修改只在内存中
        let bitmap_len = FreeMap::file_len(sectors);
        if !Inode::create(
            &volume,
            FREE_MAP_SECTOR,
            bitmap_len,
            DiskInodeKind::File,
            ROOT_DIR_SECTOR,
        ) {
            log::warn!("device too small for the free map");
            return Err(Error::NoSpace);
        }
        let backing = Self::bitmap_sectors(&volume.cache, bitmap_len).ok_or(Error::Corrupted)?;
        volume.free_map.attach(backing, &volume.cache);

        if !Dir::create(&volume, ROOT_DIR_SECTOR, ROOT_DIR_ENTRIES, ROOT_DIR_SECTOR) {
            log::warn!("device too small for the root directory");
            return Err(Error::NoSpace);
        }

        volume.cache.flush_all();
        log::debug!(
            "formatted {sectors} sectors, {} free",
            volume.free_map.free_count()
        );

        Ok(Self { volume })
    }

    /// 挂载设备上已有的文件系统
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let sectors = device.num_blocks();
        if sectors <= ROOT_DIR_SECTOR.index() {
            return Err(Error::Corrupted);
        }

        let cache = BufferCache::new(device, CACHE_CAPACITY);
        let bitmap_len = FreeMap::file_len(sectors);
        let valid = cache.map(FREE_MAP_SECTOR, 0, |record: &DiskInode| {
            record.is_valid() && record.length as usize == bitmap_len
        });
        if !valid {
            log::error!("free map inode does not match a {sectors}-sector device");
            return Err(Error::Corrupted);
        }

        let backing = Self::bitmap_sectors(&cache, bitmap_len).ok_or(Error::Corrupted)?;
        let free_map = FreeMap::load(sectors, backing, &cache).ok_or(Error::Corrupted)?;
        let volume = Arc::new(Volume::new(cache, free_map));

        Dir::open_root(&volume).map_err(|err| {
            log::error!("root directory is unusable: {err}");
            Error::Corrupted
        })?;

        log::debug!(
            "mounted {sectors} sectors, {} free",
            volume.free_map.free_count()
        );

        Ok(Self { volume })
    }

    /// 位图文件的数据扇区
    fn bitmap_sectors(cache: &BufferCache, bitmap_len: usize) -> Option<Vec<SectorId>> {
        let count = DiskInode::count_data_block(bitmap_len);
        let record = cache.map(FREE_MAP_SECTOR, 0, |record: &DiskInode| record.clone());
        let sectors = record.data_sectors(count, cache);
        (sectors.len() == count).then_some(sectors)
    }

    /// 创建 `initial_size` 字节、内容全0的文件
    pub fn create(&self, cwd: &WorkingDir, path: &str, initial_size: usize) -> Result<()> {
        self.add_inode(cwd, path, |volume, sector, parent| {
            Inode::create(volume, sector, initial_size, DiskInodeKind::File, parent)
        })
    }

    pub fn mkdir(&self, cwd: &WorkingDir, path: &str) -> Result<()> {
        self.add_inode(cwd, path, |volume, sector, parent| {
            Dir::create(volume, sector, ROOT_DIR_ENTRIES, parent)
        })
    }

    /// 分配 inode 扇区，初始化后挂到目录下；失败时只归还 inode 扇区
    fn add_inode(
        &self,
        cwd: &WorkingDir,
        path: &str,
        init: impl FnOnce(&Volume, SectorId, SectorId) -> bool,
    ) -> Result<()> {
        let volume = &self.volume;
        let (dir, name) = resolve_path(volume, cwd.dir(), path)?;

        // 空名字指的是目录本身
        if name.is_empty() {
            return Err(Error::AlreadyExists);
        }
        if !DirEntry::is_valid_name(&name) {
            return Err(Error::InvalidName);
        }
        if dir.inode().is_removed() {
            return Err(Error::NotFound);
        }
        if dir.contains(&name) {
            return Err(Error::AlreadyExists);
        }

        let sector = volume
            .free_map
            .allocate_one(&volume.cache)
            .ok_or(Error::NoSpace)?;

        let result = if init(volume, sector, dir.inode().sector()) {
            dir.add(&name, sector)
        } else {
            Err(Error::NoSpace)
        };
        if let Err(err) = result {
            log::warn!("cannot create {path}: {err}");
            volume.free_map.release(sector, 1, &volume.cache);
        }

        result
    }

    /// 打开文件或目录；`/`、`.` 以及以 `/` 结尾的路径打开目录本身
    pub fn open(&self, cwd: &WorkingDir, path: &str) -> Result<File> {
        let (dir, name) = resolve_path(&self.volume, cwd.dir(), path)?;
        let inode = if name.is_empty() {
            dir.into_inode()
        } else {
            dir.lookup(&name)?
        };

        Ok(File::new(inode))
    }

    pub fn open_dir(&self, cwd: &WorkingDir, path: &str) -> Result<Dir> {
        self.open(cwd, path)?.into_dir()
    }

    /// 删除文件或空目录，已打开的句柄在关闭前仍然可用
    pub fn remove(&self, cwd: &WorkingDir, path: &str) -> Result<()> {
        let (dir, name) = resolve_path(&self.volume, cwd.dir(), path)?;
        // 根目录或路径所指目录本身
        if name.is_empty() {
            return Err(Error::Busy);
        }

        dir.remove(&name)
    }

    pub fn chdir(&self, cwd: &mut WorkingDir, path: &str) -> Result<()> {
        let dir = self.open_dir(cwd, path)?;
        cwd.dir = Some(dir);
        Ok(())
    }

    pub fn root_dir(&self) -> Result<Dir> {
        Dir::open_root(&self.volume)
    }

    /// 把缓存中的全部脏扇区写回设备
    pub fn sync(&self) {
        self.volume.cache.flush_all();
    }

    pub fn free_sectors(&self) -> usize {
        self.volume.free_map.free_count()
    }

    pub fn is_allocated(&self, sector: SectorId) -> bool {
        self.volume.free_map.is_allocated(sector)
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        self.volume.cache.device()
    }

    /// 核对位图与全部 inode 的块映射，应在没有并发修改时调用
    pub fn check(&self) -> Report {
        fsck::check(&self.volume)
    }
}

/// 卸载即写回
impl Drop for FileSystem {
    fn drop(&mut self) {
        self.sync();
        log::debug!("unmounted");
    }
}
