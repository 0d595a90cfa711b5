//! 扇区编号

use derive_more::{Display, From, Into};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
#[repr(transparent)]
pub struct SectorId(u32);

impl core::ops::Add<u32> for SectorId {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl SectorId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// 作为设备的块ID
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// 磁盘上的扇区指针，`u32::MAX` 表示尚未分配。
///
/// 哨兵值只存在于磁盘上，读出时一律变成 [`Option<SectorId>`]。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct SectorSlot(u32);

impl SectorSlot {
    pub const EMPTY: Self = Self(u32::MAX);

    #[inline]
    pub fn get(self) -> Option<SectorId> {
        (self != Self::EMPTY).then_some(SectorId(self.0))
    }

    #[inline]
    pub fn set(&mut self, sector: Option<SectorId>) {
        *self = sector.into();
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self == Self::EMPTY
    }
}

impl From<Option<SectorId>> for SectorSlot {
    #[inline]
    fn from(sector: Option<SectorId>) -> Self {
        sector.map_or(Self::EMPTY, |sector| {
            debug_assert_ne!(sector.0, u32::MAX);
            Self(sector.0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_sentinel() {
        let mut slot = SectorSlot::EMPTY;
        assert_eq!(slot.get(), None);

        slot.set(Some(SectorId::new(0)));
        assert_eq!(slot.get(), Some(SectorId::new(0)));
        assert!(!slot.is_empty());

        slot.set(None);
        assert!(slot.is_empty());
    }
}
