use derive_more::Display;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[display(fmt = "entry already exists")]
    AlreadyExists,
    #[display(fmt = "no such file or directory")]
    NotFound,
    #[display(fmt = "not a directory")]
    NotADirectory,
    #[display(fmt = "directory not empty")]
    DirectoryNotEmpty,
    /// 位图中没有足够的空闲扇区
    #[display(fmt = "no space left on device")]
    NoSpace,
    /// 名字为空或超长
    #[display(fmt = "invalid file name")]
    InvalidName,
    /// 磁盘上的 inode 魔数不符
    #[display(fmt = "corrupted inode")]
    Corrupted,
    #[display(fmt = "resource busy")]
    Busy,
}
