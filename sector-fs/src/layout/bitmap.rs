use alloc::vec;
use alloc::vec::Vec;

/// 位组，64位一组
type BitGroup = u64;
const GROUP_BITS: usize = BitGroup::BITS as usize;

/// 内存中的扇区位图，一位对应设备上的一个扇区，置1表示已分配。
///
/// 落盘由 [`FreeMap`](crate::free_map::FreeMap) 负责，
/// 它把 [`Bitmap::to_bytes`] 写进位图文件的数据扇区。
#[derive(Debug, Clone)]
pub struct Bitmap {
    groups: Vec<BitGroup>,
    /// 有效位数，即设备扇区数
    len: usize,
}

impl Bitmap {
    pub fn new(len: usize) -> Self {
        Self {
            groups: vec![0; len.div_ceil(GROUP_BITS)],
            len,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// 落盘所需的字节数
    #[inline]
    pub fn byte_len(len: usize) -> usize {
        len.div_ceil(GROUP_BITS) * (GROUP_BITS / 8)
    }

    #[inline]
    pub fn test(&self, index: usize) -> bool {
        assert!(index < self.len);
        self.groups[index / GROUP_BITS] & (1 << (index % GROUP_BITS)) != 0
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.len);
        let (group, bit) = (index / GROUP_BITS, index % GROUP_BITS);
        if value {
            self.groups[group] |= 1 << bit;
        } else {
            self.groups[group] &= !(1 << bit);
        }
    }

    pub fn set_range(&mut self, start: usize, count: usize, value: bool) {
        (start..start + count).for_each(|index| self.set(index, value));
    }

    /// `[start, start+count)` 是否全部置位
    pub fn all(&self, start: usize, count: usize) -> bool {
        start + count <= self.len && (start..start + count).all(|index| self.test(index))
    }

    pub fn count_free(&self) -> usize {
        self.len - self.groups.iter().map(|g| g.count_ones() as usize).sum::<usize>()
    }

    /// 找到第一个空闲位并置位，返回其编号。
    /// 若位图的空间用尽，则返回空。
    pub fn scan_and_flip(&mut self) -> Option<usize> {
        // 寻找还有剩余空间的位组(即还有0)
        let (group_index, ingroup_index) = self
            .groups
            .iter()
            .enumerate()
            .find_map(|(group_index, &bits)| {
                (bits != BitGroup::MAX).then_some((group_index, bits.trailing_ones() as usize))
            })?;

        let index = group_index * GROUP_BITS + ingroup_index;
        // 末组超出 len 的位不可分配
        if index >= self.len {
            return None;
        }

        self.groups[group_index] |= 1 << ingroup_index;
        Some(index)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.groups.iter().flat_map(|g| g.to_le_bytes()).collect()
    }

    /// 从落盘的字节恢复，`bytes` 至少要有 [`Bitmap::byte_len`] 个字节
    pub fn load(len: usize, bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..Self::byte_len(len))?;
        let groups = bytes
            .chunks_exact(GROUP_BITS / 8)
            .map(|chunk| {
                let mut raw = [0; GROUP_BITS / 8];
                raw.copy_from_slice(chunk);
                BitGroup::from_le_bytes(raw)
            })
            .collect();

        Some(Self { groups, len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_skips_used_bits() {
        let mut bitmap = Bitmap::new(130);
        bitmap.set(0, true);
        bitmap.set(1, true);

        assert_eq!(bitmap.scan_and_flip(), Some(2));
        bitmap.set_range(3, 100, true);
        assert_eq!(bitmap.scan_and_flip(), Some(103));
        assert_eq!(bitmap.count_free(), 130 - 104);
        assert!(bitmap.all(0, 104));
        assert!(!bitmap.all(0, 105));
    }

    #[test]
    fn scan_respects_length() {
        let mut bitmap = Bitmap::new(3);
        assert_eq!(bitmap.scan_and_flip(), Some(0));
        assert_eq!(bitmap.scan_and_flip(), Some(1));
        assert_eq!(bitmap.scan_and_flip(), Some(2));
        assert_eq!(bitmap.scan_and_flip(), None);
        assert_eq!(bitmap.count_free(), 0);
    }

    #[test]
    fn bytes_reload() {
        let mut bitmap = Bitmap::new(200);
        bitmap.set_range(60, 10, true);
        bitmap.set(199, true);

        let bytes = bitmap.to_bytes();
        assert_eq!(bytes.len(), Bitmap::byte_len(200));

        let loaded = Bitmap::load(200, &bytes).unwrap();
        assert!(loaded.all(60, 10));
        assert!(loaded.test(199));
        assert!(!loaded.test(59));
        assert!(Bitmap::load(200, &bytes[..8]).is_none());
    }
}
