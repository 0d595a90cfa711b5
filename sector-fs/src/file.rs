//! 打开的文件：inode 加上读写位置

use vfs::Stat;

use crate::directory::Dir;
use crate::inode::Inode;
use crate::sector::SectorId;
use crate::Result;

#[derive(Debug)]
pub struct File {
    inode: Inode,
    /// **文件**内的偏移量
    pos: usize,
    /// 本句柄是否调用过 [`Inode::deny_write`]
    deny_write: bool,
}

impl File {
    #[inline]
    pub fn new(inode: Inode) -> Self {
        Self {
            inode,
            pos: 0,
            deny_write: false,
        }
    }

    /// 从当前位置读，并前移读写位置
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let size = self.inode.read_at(buf, self.pos);
        self.pos += size;
        size
    }

    /// 从当前位置写，并前移读写位置；目录不能当作文件写
    pub fn write(&mut self, buf: &[u8]) -> usize {
        if self.is_dir() {
            return 0;
        }
        let size = self.inode.write_at(buf, self.pos);
        self.pos += size;
        size
    }

    #[inline]
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        self.inode.read_at(buf, offset)
    }

    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        if self.is_dir() {
            return 0;
        }
        self.inode.write_at(buf, offset)
    }

    /// 可以越过文件末尾，之后的写入会扩展文件
    #[inline]
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    #[inline]
    pub fn tell(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.inode.length()
    }

    pub fn deny_write(&mut self) {
        if !self.deny_write {
            self.deny_write = true;
            self.inode.deny_write();
        }
    }

    pub fn allow_write(&mut self) {
        if self.deny_write {
            self.deny_write = false;
            self.inode.allow_write();
        }
    }

    #[inline]
    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.inode.is_dir()
    }

    /// inode 编号即 inode 所在扇区
    #[inline]
    pub fn inumber(&self) -> SectorId {
        self.inode.sector()
    }

    /// 把打开的目录当作 [`Dir`] 使用
    pub fn into_dir(self) -> Result<Dir> {
        Dir::open(self.inode.clone())
    }

    #[inline]
    pub fn stat(&self) -> Stat {
        self.inode.stat()
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.allow_write();
    }
}
