//! # 一致性检查
//!
//! 从位图文件、根目录以及所有打开着的 inode 出发遍历整棵目录树，
//! 统计每个扇区被引用的次数，再与位图逐位核对。

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::iter;

use crate::directory::Dir;
use crate::inode::{Inode, Volume};
use crate::sector::SectorId;
use crate::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

/// 检查结果，各列表按扇区号升序
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Report {
    /// 被引用却未在位图中分配
    pub unallocated: Vec<SectorId>,
    /// 已分配却无人引用
    pub leaked: Vec<SectorId>,
    /// 被引用了不止一次
    pub duplicated: Vec<SectorId>,
    /// 目录项指向的扇区不是合法的 inode
    pub corrupted: Vec<SectorId>,
    /// 遍历到的 inode 数
    pub inodes: usize,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.unallocated.is_empty()
            && self.leaked.is_empty()
            && self.duplicated.is_empty()
            && self.corrupted.is_empty()
    }
}

pub(crate) fn check(volume: &Arc<Volume>) -> Report {
    let sectors = volume.free_map.len();
    let mut report = Report::default();
    let mut owners: BTreeMap<SectorId, usize> = BTreeMap::new();
    let mut visited = BTreeSet::new();

    // 已删除但仍打开的 inode 依然占有扇区
    let mut pending = vec![FREE_MAP_SECTOR, ROOT_DIR_SECTOR];
    pending.extend(volume.open_sectors());

    while let Some(sector) = pending.pop() {
        if !visited.insert(sector) {
            continue;
        }

        let inode = (sector.index() < sectors)
            .then(|| Inode::open(volume, sector).ok())
            .flatten();
        let Some(inode) = inode else {
            report.corrupted.push(sector);
            continue;
        };
        report.inodes += 1;

        for owned in iter::once(sector).chain(inode.owned_sectors()) {
            *owners.entry(owned).or_default() += 1;
        }
        if let Ok(dir) = Dir::open(inode) {
            pending.extend(dir.children());
        }
    }

    for (&sector, &count) in &owners {
        if !volume.free_map.is_allocated(sector) {
            report.unallocated.push(sector);
        }
        if count > 1 {
            report.duplicated.push(sector);
        }
    }

    report.leaked = (0..sectors as u32)
        .map(SectorId::new)
        .filter(|sector| volume.free_map.is_allocated(*sector) && !owners.contains_key(sector))
        .collect();
    report.corrupted.sort_unstable();

    if !report.is_clean() {
        log::warn!("inconsistent volume: {report:?}");
    }

    report
}
