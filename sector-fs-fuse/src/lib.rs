//! 宿主机上的 sector-fs 工具：以普通文件作为块设备


use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use block_dev::{BlockDevice, BLOCK_SIZE};

/// 以文件为后端的块设备，文件长度按整块截断
#[derive(Debug)]
pub struct BlockFile {
    file: Mutex<File>,
    num_blocks: usize,
}

impl BlockFile {
    pub fn new(file: File) -> io::Result<Self> {
        let num_blocks = file.metadata()?.len() as usize / BLOCK_SIZE;
        Ok(Self {
            file: Mutex::new(file),
            num_blocks,
        })
    }
}

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        assert_eq!(buf.len(), BLOCK_SIZE, "not a complete block!");
        let mut file = self.file.lock().expect("block file poisoned");
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .expect("seeking error");
        file.read_exact(buf).expect("not a complete block!");
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        assert_eq!(buf.len(), BLOCK_SIZE, "not a complete block!");
        let mut file = self.file.lock().expect("block file poisoned");
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .expect("seeking error");
        file.write_all(buf).expect("not a complete block!");
    }

    #[inline]
    fn num_blocks(&self) -> usize {
        self.num_blocks
    }
}
