//! # 目录层
//!
//! 目录是一个由 [`DirEntry`] 记录组成的普通文件，经由 [`Inode`] 的字节接口读写。
//! 删除的目录项留作墓碑供之后复用，从不压缩。
//!
//! 目录项里没有 `.` 和 `..`：父目录记在 inode 的 `parent` 字段，
//! 路径解析只在路径开头特判这两个名字。
//!
//! 同一目录上的 `add` 与 `remove` 先查找再写入，两步之间不持锁，并发时可能交错。

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use vfs::DirEntryType;

use crate::inode::{Inode, Volume};
use crate::layout::{DirEntry, DiskInodeKind};
use crate::sector::SectorId;
use crate::{Error, Result, ROOT_DIR_SECTOR};

/// 打开的目录
#[derive(Debug)]
pub struct Dir {
    inode: Inode,
    /// [`Dir::next_entry`] 的读取位置
    pos: usize,
}

impl Dir {
    /// 在扇区 `sector` 上创建能容纳 `entry_cnt` 个目录项的空目录
    pub(crate) fn create(
        volume: &Volume,
        sector: SectorId,
        entry_cnt: usize,
        parent: SectorId,
    ) -> bool {
        Inode::create(
            volume,
            sector,
            entry_cnt * DirEntry::SIZE,
            DiskInodeKind::Directory,
            parent,
        )
    }

    pub fn open(inode: Inode) -> Result<Self> {
        if !inode.is_dir() {
            return Err(Error::NotADirectory);
        }
        Ok(Self { inode, pos: 0 })
    }

    pub(crate) fn open_root(volume: &Arc<Volume>) -> Result<Self> {
        Self::open(Inode::open(volume, ROOT_DIR_SECTOR)?)
    }

    /// 同一目录的新句柄，读取位置归零
    pub fn reopen(&self) -> Self {
        Self {
            inode: self.inode.clone(),
            pos: 0,
        }
    }

    pub fn open_parent(&self) -> Result<Self> {
        Self::open(Inode::open(self.inode.volume(), self.inode.parent())?)
    }

    #[inline]
    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    #[inline]
    pub fn into_inode(self) -> Inode {
        self.inode
    }

    /// 按名字打开目录下的 inode
    pub fn lookup(&self, name: &str) -> Result<Inode> {
        let (_, entry) = self.find(name).ok_or(Error::NotFound)?;
        Inode::open(self.inode.volume(), entry.inode_sector())
    }

    /// 添加目录项，优先复用墓碑，否则追加到末尾
    pub fn add(&self, name: &str, sector: SectorId) -> Result<()> {
        if !DirEntry::is_valid_name(name) {
            return Err(Error::InvalidName);
        }
        if self.find(name).is_some() {
            return Err(Error::AlreadyExists);
        }

        let offset = self
            .records()
            .find(|(_, entry)| !entry.in_use())
            .map_or_else(|| self.inode.length(), |(offset, _)| offset);

        let entry = DirEntry::new(name, sector);
        if self.inode.write_at(entry.as_bytes(), offset) != DirEntry::SIZE {
            return Err(Error::NoSpace);
        }

        Ok(())
    }

    /// 删除目录项并标记其 inode 为已删除；非空目录不可删除
    pub fn remove(&self, name: &str) -> Result<()> {
        let (offset, mut entry) = self.find(name).ok_or(Error::NotFound)?;

        let inode = Inode::open(self.inode.volume(), entry.inode_sector())?;
        let inode = if inode.is_dir() {
            let dir = Self::open(inode)?;
            if !dir.is_empty() {
                return Err(Error::DirectoryNotEmpty);
            }
            dir.into_inode()
        } else {
            inode
        };

        entry.bury();
        if self.inode.write_at(entry.as_bytes(), offset) != DirEntry::SIZE {
            return Err(Error::NoSpace);
        }
        inode.remove();

        Ok(())
    }

    /// 读出下一个在用目录项的名字，读完时返回空
    pub fn next_entry(&mut self) -> Option<String> {
        let mut entry = DirEntry::default();
        while self.inode.read_at(entry.as_bytes_mut(), self.pos) == DirEntry::SIZE {
            self.pos += DirEntry::SIZE;
            if entry.in_use() {
                return Some(entry.name().into());
            }
        }

        None
    }

    pub fn is_empty(&self) -> bool {
        self.records().all(|(_, entry)| !entry.in_use())
    }

    /// 列出全部在用目录项
    pub fn ls(&self) -> Result<Vec<vfs::DirEntry>> {
        self.records()
            .filter(|(_, entry)| entry.in_use())
            .map(|(_, entry)| {
                let inode = Inode::open(self.inode.volume(), entry.inode_sector())?;
                Ok(vfs::DirEntry {
                    inode: entry.inode_sector().raw() as u64,
                    ty: if inode.is_dir() {
                        DirEntryType::Directory
                    } else {
                        DirEntryType::Regular
                    },
                    name: entry.name().into(),
                })
            })
            .collect()
    }

    #[inline]
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// 全部在用目录项指向的 inode
    pub(crate) fn children(&self) -> Vec<SectorId> {
        self.records()
            .filter(|(_, entry)| entry.in_use())
            .map(|(_, entry)| entry.inode_sector())
            .collect()
    }

    /// 找到名为 `name` 的在用目录项及其偏移
    fn find(&self, name: &str) -> Option<(usize, DirEntry)> {
        self.records()
            .find(|(_, entry)| entry.in_use() && entry.name() == name)
    }

    /// 按顺序遍历全部记录（含墓碑）
    fn records(&self) -> impl Iterator<Item = (usize, DirEntry)> + '_ {
        (0..self.inode.length())
            .step_by(DirEntry::SIZE)
            .map_while(|offset| {
                let mut entry = DirEntry::default();
                (self.inode.read_at(entry.as_bytes_mut(), offset) == DirEntry::SIZE)
                    .then_some((offset, entry))
            })
    }
}

/// 路径解析：返回最后一个分量所在的目录以及该分量的名字。
///
/// 以 `/` 开头的从根目录出发，否则从工作目录出发（没有时为根目录）。
/// 连续的 `/` 被忽略；末尾带 `/` 时最后一个分量必须是目录，
/// 返回该目录本身与空名字。名字为空表示目录本身。
/// 开头的 `.` 指起点目录，`..` 指起点目录的父目录。
pub(crate) fn resolve_path(
    volume: &Arc<Volume>,
    cwd: Option<&Dir>,
    path: &str,
) -> Result<(Dir, String)> {
    let (mut dir, rest) = match path.strip_prefix('/') {
        Some(rest) => (Dir::open_root(volume)?, rest),
        None => match cwd {
            Some(cwd) => (cwd.reopen(), path),
            None => (Dir::open_root(volume)?, path),
        },
    };

    let trailing_slash = rest.ends_with('/');
    let mut components = rest.split('/').filter(|c| !c.is_empty()).peekable();
    match components.peek() {
        Some(&".") => {
            components.next();
        }
        Some(&"..") => {
            components.next();
            dir = dir.open_parent()?;
        }
        _ => (),
    }

    let Some(mut name) = components.next() else {
        return Ok((dir, String::new()));
    };
    for next in components {
        // 旧句柄随赋值关闭
        dir = Dir::open(dir.lookup(name)?)?;
        name = next;
    }

    if trailing_slash {
        return Ok((Dir::open(dir.lookup(name)?)?, String::new()));
    }

    Ok((dir, name.into()))
}

#[cfg(test)]
mod tests {
    use block_dev::RamDisk;

    use super::*;
    use crate::block_cache::BufferCache;
    use crate::free_map::FreeMap;
    use crate::{CACHE_CAPACITY, ROOT_DIR_ENTRIES};

    fn volume() -> Arc<Volume> {
        let cache = BufferCache::new(Arc::new(RamDisk::new(512)), CACHE_CAPACITY);
        let volume = Arc::new(Volume::new(cache, FreeMap::new(512)));
        assert!(Dir::create(&volume, ROOT_DIR_SECTOR, ROOT_DIR_ENTRIES, ROOT_DIR_SECTOR));
        volume
    }

    fn mkdir(volume: &Arc<Volume>, parent: &Dir, name: &str) -> SectorId {
        let sector = volume.free_map.allocate_one(&volume.cache).unwrap();
        assert!(Dir::create(volume, sector, ROOT_DIR_ENTRIES, parent.inode().sector()));
        parent.add(name, sector).unwrap();
        sector
    }

    fn touch(volume: &Arc<Volume>, parent: &Dir, name: &str) -> SectorId {
        let sector = volume.free_map.allocate_one(&volume.cache).unwrap();
        assert!(Inode::create(volume, sector, 0, DiskInodeKind::File, parent.inode().sector()));
        parent.add(name, sector).unwrap();
        sector
    }

    #[test]
    fn add_lookup_and_tombstones() {
        let volume = volume();
        let root = Dir::open_root(&volume).unwrap();

        let a = touch(&volume, &root, "a");
        let b = touch(&volume, &root, "b");
        assert_eq!(root.lookup("a").unwrap().sector(), a);
        assert_eq!(root.add("a", b), Err(Error::AlreadyExists));
        assert_eq!(root.add("", b), Err(Error::InvalidName));
        assert_eq!(root.add("much_too_long_name", b), Err(Error::InvalidName));

        root.remove("a").unwrap();
        assert_eq!(root.lookup("a").err(), Some(Error::NotFound));
        assert_eq!(root.remove("a"), Err(Error::NotFound));

        // 墓碑被复用，目录文件不变长
        let length = root.inode().length();
        touch(&volume, &root, "c");
        assert_eq!(root.inode().length(), length);
    }

    #[test]
    fn directory_grows_past_initial_entries() {
        let volume = volume();
        let root = Dir::open_root(&volume).unwrap();

        for i in 0..ROOT_DIR_ENTRIES + 4 {
            touch(&volume, &root, &alloc::format!("f{i}"));
        }
        assert_eq!(root.inode().length(), (ROOT_DIR_ENTRIES + 4) * DirEntry::SIZE);
        assert_eq!(root.ls().unwrap().len(), ROOT_DIR_ENTRIES + 4);
    }

    #[test]
    fn non_empty_directory_stays() {
        let volume = volume();
        let root = Dir::open_root(&volume).unwrap();
        mkdir(&volume, &root, "docs");
        let docs = Dir::open(root.lookup("docs").unwrap()).unwrap();
        touch(&volume, &docs, "x");

        assert_eq!(root.remove("docs"), Err(Error::DirectoryNotEmpty));
        assert!(root.lookup("docs").is_ok());

        docs.remove("x").unwrap();
        root.remove("docs").unwrap();
        assert!(docs.inode().is_removed());
    }

    #[test]
    fn iterate_skips_tombstones() {
        let volume = volume();
        let root = Dir::open_root(&volume).unwrap();
        for name in ["one", "two", "three"] {
            touch(&volume, &root, name);
        }
        root.remove("two").unwrap();

        let mut reader = root.reopen();
        let mut names = Vec::new();
        while let Some(name) = reader.next_entry() {
            names.push(name);
        }
        assert_eq!(names, ["one", "three"]);
        assert!(!root.is_empty());
    }

    #[test]
    fn resolve_paths() {
        let volume = volume();
        let root = Dir::open_root(&volume).unwrap();
        let docs_sector = mkdir(&volume, &root, "docs");
        let docs = Dir::open(root.lookup("docs").unwrap()).unwrap();
        touch(&volume, &root, "plain");

        let (dir, name) = resolve_path(&volume, None, "/docs/x").unwrap();
        assert_eq!((dir.inode().sector(), name.as_str()), (docs_sector, "x"));

        let (dir, name) = resolve_path(&volume, Some(&docs), "x").unwrap();
        assert_eq!((dir.inode().sector(), name.as_str()), (docs_sector, "x"));

        let (dir, name) = resolve_path(&volume, Some(&docs), "../plain").unwrap();
        assert_eq!((dir.inode().sector(), name.as_str()), (ROOT_DIR_SECTOR, "plain"));

        let (dir, name) = resolve_path(&volume, Some(&docs), "./y").unwrap();
        assert_eq!((dir.inode().sector(), name.as_str()), (docs_sector, "y"));

        let (dir, name) = resolve_path(&volume, None, "//docs//").unwrap();
        assert_eq!((dir.inode().sector(), name.as_str()), (docs_sector, ""));

        let (dir, name) = resolve_path(&volume, None, "/").unwrap();
        assert_eq!((dir.inode().sector(), name.as_str()), (ROOT_DIR_SECTOR, ""));

        assert_eq!(
            resolve_path(&volume, None, "/docs/missing/x").err(),
            Some(Error::NotFound)
        );
        assert_eq!(
            resolve_path(&volume, None, "/plain/x").err(),
            Some(Error::NotADirectory)
        );

        // 末尾的 `/` 要求最后一个分量是目录
        let (dir, name) = resolve_path(&volume, Some(&docs), "../docs/").unwrap();
        assert_eq!((dir.inode().sector(), name.as_str()), (docs_sector, ""));
        assert_eq!(
            resolve_path(&volume, None, "plain/").err(),
            Some(Error::NotADirectory)
        );
        assert_eq!(
            resolve_path(&volume, None, "missing/").err(),
            Some(Error::NotFound)
        );
    }

    #[test]
    fn root_parent_is_root() {
        let volume = volume();
        let root = Dir::open_root(&volume).unwrap();
        assert_eq!(root.open_parent().unwrap().inode().sector(), ROOT_DIR_SECTOR);

        let (dir, name) = resolve_path(&volume, None, "..").unwrap();
        assert_eq!((dir.inode().sector(), name.as_str()), (ROOT_DIR_SECTOR, ""));
    }
}
