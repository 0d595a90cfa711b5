use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::{BlockDevice, BLOCK_SIZE};

/// 内存中的块设备，并记录读写次数
#[derive(Debug)]
pub struct RamDisk {
    blocks: Mutex<Vec<[u8; BLOCK_SIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    pub fn new(num_blocks: usize) -> Self {
        Self {
            blocks: Mutex::new(vec![[0; BLOCK_SIZE]; num_blocks]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// 设备已完成的读块次数
    #[inline]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// 设备已完成的写块次数
    #[inline]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// 绕过计数直接查看某块的内容
    pub fn peek(&self, block_id: usize) -> [u8; BLOCK_SIZE] {
        self.blocks.lock()[block_id]
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        assert_eq!(buf.len(), BLOCK_SIZE, "not a complete block!");
        buf.copy_from_slice(&self.blocks.lock()[block_id]);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        assert_eq!(buf.len(), BLOCK_SIZE, "not a complete block!");
        self.blocks.lock()[block_id].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn num_blocks(&self) -> usize {
        self.blocks.lock().len()
    }
}
