use crate::DirEntryType;

#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C, align(32))]
pub struct Stat {
    /// Inode number
    pub ino: u64,
    pub mode: DirEntryType,
    /// Optimal I/O block size
    pub block_size: u64,
    /// Occupying blocks, including index blocks
    pub blocks: u64,
    /// File size
    pub size: u64,
}
