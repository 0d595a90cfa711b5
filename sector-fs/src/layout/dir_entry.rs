use core::{mem, ptr, slice};

use crate::NAME_MAX;
use crate::sector::SectorId;

/// 目录项，作为记录连续存放在目录文件中
#[derive(Debug, Clone)]
#[repr(C)]
pub struct DirEntry {
    inode_sector: SectorId,
    // 最后一字节留给 \0
    name: [u8; NAME_MAX + 1],
    /// 非0表示在用；为0的是墓碑，可被复用
    in_use: u8,
}

const _: () = assert!(mem::size_of::<DirEntry>() == DirEntry::SIZE);

impl Default for DirEntry {
    fn default() -> Self {
        Self {
            inode_sector: SectorId::new(0),
            name: [0; NAME_MAX + 1],
            in_use: 0,
        }
    }
}

impl DirEntry {
    /// 目录项大小恒为20字节
    pub const SIZE: usize = 20;

    /// `name` 须已通过 [`DirEntry::is_valid_name`] 检查
    #[inline]
    pub fn new(name: &str, inode_sector: SectorId) -> Self {
        let bytes = name.as_bytes();
        let mut raw = [0; NAME_MAX + 1];
        raw[..bytes.len()].copy_from_slice(bytes);

        Self {
            inode_sector,
            name: raw,
            in_use: 1,
        }
    }

    #[inline]
    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty() && name.len() <= NAME_MAX && !name.contains(['/', '\0'])
    }

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(NAME_MAX);
        core::str::from_utf8(&self.name[..len]).unwrap_or_default()
    }

    #[inline]
    pub fn inode_sector(&self) -> SectorId {
        self.inode_sector
    }

    #[inline]
    pub fn in_use(&self) -> bool {
        self.in_use != 0
    }

    /// 墓碑化
    #[inline]
    pub fn bury(&mut self) {
        self.in_use = 0;
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(ptr::from_ref(self).cast(), Self::SIZE) }
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(ptr::from_mut(self).cast(), Self::SIZE) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_rules() {
        assert!(DirEntry::is_valid_name("a"));
        assert!(DirEntry::is_valid_name("fourteen_chars"));
        assert!(!DirEntry::is_valid_name("fifteen_chars__"));
        assert!(!DirEntry::is_valid_name(""));
        assert!(!DirEntry::is_valid_name("a/b"));
    }

    #[test]
    fn record_bytes() {
        let entry = DirEntry::new("hello", SectorId::new(42));
        let mut copy = DirEntry::default();
        copy.as_bytes_mut().copy_from_slice(entry.as_bytes());

        assert_eq!(copy.name(), "hello");
        assert_eq!(copy.inode_sector(), SectorId::new(42));
        assert!(copy.in_use());

        copy.bury();
        assert!(!copy.in_use());
        assert_eq!(copy.name(), "hello");
    }
}
