//! 反向映射表
//!
//! 记录每个物理页被哪些 (地址空间, 虚拟地址) 映射，用于写时复制后
//! 解除陈旧映射、写回后重新写保护。全局一把锁，位于锁顺序的最末端。

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use sync::SpinLock;

use crate::address::Ppn;
use crate::space::SpaceId;

/// 一条反向映射
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapping {
    /// 映射所在的地址空间
    pub space: SpaceId,
    /// 虚拟地址
    pub address: usize,
}

impl PageMapping {
    /// 构造
    pub fn new(space: SpaceId, address: usize) -> Self {
        Self { space, address }
    }
}

/// 反向映射表
pub struct MappingTable {
    table: SpinLock<BTreeMap<Ppn, Vec<PageMapping>>>,
}

impl MappingTable {
    /// 空表
    pub fn new() -> Self {
        Self {
            table: SpinLock::new(BTreeMap::new()),
        }
    }

    /// 记录映射，已存在时不重复记录
    pub fn add(&self, ppn: Ppn, mapping: PageMapping) {
        let mut table = self.table.lock();
        let mappings = table.entry(ppn).or_default();
        if !mappings.contains(&mapping) {
            mappings.push(mapping);
        }
    }

    /// 删除映射，返回是否存在
    pub fn remove(&self, ppn: Ppn, mapping: PageMapping) -> bool {
        let mut table = self.table.lock();
        let Some(mappings) = table.get_mut(&ppn) else {
            return false;
        };
        let before = mappings.len();
        mappings.retain(|m| *m != mapping);
        let removed = mappings.len() != before;
        if mappings.is_empty() {
            table.remove(&ppn);
        }
        removed
    }

    /// 某页的全部映射
    pub fn mappings_of(&self, ppn: Ppn) -> Vec<PageMapping> {
        self.table.lock().get(&ppn).cloned().unwrap_or_default()
    }

    /// 某页的映射数
    pub fn mapping_count(&self, ppn: Ppn) -> usize {
        self.table.lock().get(&ppn).map_or(0, Vec::len)
    }

    /// 删除一个地址空间的全部记录
    pub fn remove_space(&self, space: SpaceId) {
        let mut table = self.table.lock();
        table.retain(|_, mappings| {
            mappings.retain(|m| m.space != space);
            !mappings.is_empty()
        });
    }

    /// 映射总数
    pub fn len(&self) -> usize {
        self.table.lock().values().map(Vec::len).sum()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}

impl Default for MappingTable {
    fn default() -> Self {
        Self::new()
    }
}
