//! 地址空间
//!
//! 每个 team（以及内核）一个地址空间：按地址排序的区域集合、保留但
//! 未映射的范围、一张转换表，以及保护区域结构的读写锁。
//!
//! 区域结构的修改（创建、删除、调整大小、切割）需要写锁；缺页只需读锁。
//! 转换表有自己的自旋锁，总是在区域与缓存锁之后获取。

mod locking;

pub(crate) use locking::MultiSpaceLocker;
pub use locking::{SpaceLock, SpaceReadLocked, SpaceWriteLocked};

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Bound;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use sync::{RwLock, SpinLock};
use uapi::area::AddressSpec;

use crate::address::is_page_aligned;
use crate::area::{Area, AreaId};
use crate::error::{VmError, VmResult};
use crate::translation_map::TranslationMap;

/// 地址空间编号（即 team 编号；内核为 0）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(pub u32);

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 保留但未映射的范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedRange {
    /// 起始地址
    pub base: usize,
    /// 大小
    pub size: usize,
}

impl ReservedRange {
    fn end(&self) -> usize {
        self.base + self.size
    }
}

/// 地址空间
pub struct AddressSpace {
    id: SpaceId,
    base: usize,
    end: usize,
    kernel: bool,
    state: RwLock<SpaceInner>,
    map: SpinLock<Box<dyn TranslationMap>>,
    deleting: AtomicBool,
    fault_count: AtomicU64,
}

impl AddressSpace {
    pub(crate) fn new(
        id: SpaceId,
        base: usize,
        size: usize,
        kernel: bool,
        map: Box<dyn TranslationMap>,
    ) -> Arc<Self> {
        let end = base + size;
        Arc::new(Self {
            id,
            base,
            end,
            kernel,
            state: RwLock::new(SpaceInner::new(base, end)),
            map: SpinLock::new(map),
            deleting: AtomicBool::new(false),
            fault_count: AtomicU64::new(0),
        })
    }

    /// 编号
    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// 起始地址
    pub fn base(&self) -> usize {
        self.base
    }

    /// 结束地址（不含）
    pub fn end(&self) -> usize {
        self.end
    }

    /// 是否内核地址空间
    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// 地址是否在本空间范围内
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.end
    }

    /// 是否正在销毁
    pub fn is_deleting(&self) -> bool {
        self.deleting.load(Ordering::Acquire)
    }

    pub(crate) fn mark_deleting(&self) {
        self.deleting.store(true, Ordering::Release);
    }

    /// 本空间发生过的软缺页次数
    pub fn fault_count(&self) -> u64 {
        self.fault_count.load(Ordering::Relaxed)
    }

    pub(crate) fn count_fault(&self) {
        self.fault_count.fetch_add(1, Ordering::Relaxed);
    }

    /// 读锁
    pub fn read_lock(self: &Arc<Self>) -> SpaceReadLocked {
        SpaceReadLocked::lock(self.clone())
    }

    /// 写锁
    pub fn write_lock(self: &Arc<Self>) -> SpaceWriteLocked {
        SpaceWriteLocked::lock(self.clone())
    }

    /// 转换表
    pub(crate) fn map(&self) -> &SpinLock<Box<dyn TranslationMap>> {
        &self.map
    }

    /// 区域数
    pub fn area_count(self: &Arc<Self>) -> usize {
        self.read_lock().inner().areas.len()
    }

    /// 全部区域的 (编号, 起始地址, 大小)，按地址排序
    pub fn area_ranges(self: &Arc<Self>) -> Vec<(AreaId, usize, usize)> {
        self.read_lock()
            .inner()
            .areas()
            .map(|a| (a.id(), a.base(), a.size()))
            .collect()
    }

    /// 保留范围，按地址排序
    pub fn reserved_ranges(self: &Arc<Self>) -> Vec<ReservedRange> {
        self.read_lock().inner().reserved.values().copied().collect()
    }

    /// 已映射的字节数
    pub fn mapped_size(&self) -> usize {
        self.map.lock().mapped_size()
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("base", &format_args!("{:#x}", self.base))
            .field("end", &format_args!("{:#x}", self.end))
            .field("kernel", &self.kernel)
            .finish()
    }
}

// ============================================================================
// SpaceInner - 受地址空间锁保护的状态
// ============================================================================

/// 受地址空间锁保护的状态
pub struct SpaceInner {
    base: usize,
    end: usize,
    areas: BTreeMap<usize, Area>,
    area_bases: BTreeMap<AreaId, usize>,
    reserved: BTreeMap<usize, ReservedRange>,
}

impl SpaceInner {
    fn new(base: usize, end: usize) -> Self {
        Self {
            base,
            end,
            areas: BTreeMap::new(),
            area_bases: BTreeMap::new(),
            reserved: BTreeMap::new(),
        }
    }

    /// 按编号查找区域
    pub fn area(&self, id: AreaId) -> Option<&Area> {
        let base = self.area_bases.get(&id)?;
        self.areas.get(base)
    }

    pub(crate) fn area_mut(&mut self, id: AreaId) -> Option<&mut Area> {
        let base = self.area_bases.get(&id)?;
        self.areas.get_mut(base)
    }

    /// 查找覆盖地址的区域
    pub fn lookup(&self, address: usize) -> Option<&Area> {
        self.areas
            .range(..=address)
            .next_back()
            .map(|(_, area)| area)
            .filter(|area| area.contains(address))
    }

    /// 按地址顺序遍历区域
    pub fn areas(&self) -> impl Iterator<Item = &Area> {
        self.areas.values()
    }

    /// 与 `[start, end)` 相交的区域编号
    pub(crate) fn overlapping(&self, start: usize, end: usize) -> Vec<AreaId> {
        self.areas
            .values()
            .filter(|a| a.overlaps(start, end))
            .map(|a| a.id)
            .collect()
    }

    pub(crate) fn insert_area(&mut self, area: Area) {
        debug_assert!(self.is_range_free(area.base, area.end(), None, false));
        self.area_bases.insert(area.id, area.base);
        self.areas.insert(area.base, area);
    }

    pub(crate) fn remove_area(&mut self, id: AreaId) -> Option<Area> {
        let base = self.area_bases.remove(&id)?;
        self.areas.remove(&base)
    }

    /// 区域起点移动后重新登记
    pub(crate) fn shrink_area_head(&mut self, id: AreaId, delta: usize) -> Option<&Area> {
        let mut area = self.remove_area(id)?;
        area.shrink_head(delta);
        let base = area.base;
        self.insert_area(area);
        self.areas.get(&base)
    }

    /// 挖掉区域中间的一段，返回新的后半段区域
    pub(crate) fn split_area(
        &mut self,
        id: AreaId,
        cut_start: usize,
        cut_end: usize,
        new_id: AreaId,
    ) -> Option<&Area> {
        let second = self.area_mut(id)?.split_off(cut_start, cut_end, new_id);
        let base = second.base;
        self.insert_area(second);
        self.areas.get(&base)
    }

    /// 修改区域大小，返回原大小
    ///
    /// 增长时新范围不能与其它区域或保留范围重叠，也不能越过空间末端；
    /// 缩小时被裁掉的尾部不能含有被固定的内存。
    pub(crate) fn resize_area(&mut self, id: AreaId, new_size: usize) -> VmResult<usize> {
        let (base, old_end, old_size) = {
            let area = self.area(id).ok_or(VmError::BadArea)?;
            (area.base, area.end(), area.size)
        };
        if new_size > old_size {
            let new_end = base.checked_add(new_size).ok_or(VmError::NoVirtualSpace)?;
            if new_end > self.end || !self.is_range_free(old_end, new_end, Some(id), true) {
                return Err(VmError::AddressInUse);
            }
        } else if new_size < old_size {
            let area = self.area(id).ok_or(VmError::BadArea)?;
            if area.has_wired_range_in(base + new_size, old_end) {
                return Err(VmError::Busy);
            }
        }
        self.area_mut(id).ok_or(VmError::BadArea)?.set_size(new_size);
        Ok(old_size)
    }

    /// `[start, end)` 是否空闲
    ///
    /// 区域之间、保留范围之间互不重叠，所以各自只需看起点在 `end` 之前
    /// 的最后一项。
    pub(crate) fn is_range_free(
        &self,
        start: usize,
        end: usize,
        ignore: Option<AreaId>,
        honor_reserved: bool,
    ) -> bool {
        if start < self.base || end > self.end {
            return false;
        }
        let area_hit = self
            .areas
            .range(..end)
            .rev()
            .find(|(_, a)| Some(a.id) != ignore)
            .is_some_and(|(_, a)| a.end() > start);
        let reserved_hit = honor_reserved
            && self
                .reserved
                .range(..end)
                .next_back()
                .is_some_and(|(_, r)| r.end() > start);
        !area_hit && !reserved_hit
    }

    /// 终点在 `from` 之后、起点最小的占用区间
    fn next_occupied(&self, from: usize, honor_reserved: bool) -> Option<(usize, usize)> {
        fn after<T>(
            map: &BTreeMap<usize, T>,
            from: usize,
            end_of: impl Fn(&T) -> usize,
        ) -> Option<(usize, usize)> {
            map.range(..=from)
                .next_back()
                .filter(|(_, item)| end_of(item) > from)
                .or_else(|| map.range((Bound::Excluded(from), Bound::Unbounded)).next())
                .map(|(base, item)| (*base, end_of(item)))
        }

        let area = after(&self.areas, from, Area::end);
        let reserved = if honor_reserved {
            after(&self.reserved, from, ReservedRange::end)
        } else {
            None
        };
        match (area, reserved) {
            (Some(a), Some(r)) => Some(if a.0 <= r.0 { a } else { r }),
            (a, r) => a.or(r),
        }
    }

    /// 从 `from` 开始第一个能放下 `size` 字节的空闲位置
    fn first_fit(&self, from: usize, size: usize, honor_reserved: bool) -> Option<usize> {
        let mut candidate = from.max(self.base);
        loop {
            let end = candidate.checked_add(size)?;
            if end > self.end {
                return None;
            }
            match self.next_occupied(candidate, honor_reserved) {
                // 与候选位置重叠，跳到占用区间之后
                Some((start, occupied_end)) if start < end => candidate = candidate.max(occupied_end),
                _ => return Some(candidate),
            }
        }
    }

    /// 按放置方式为 `size` 字节找位置
    ///
    /// 精确放置可以与保留范围重叠；其它方式避开保留范围。
    pub(crate) fn find_placement(&self, spec: AddressSpec, size: usize) -> VmResult<usize> {
        match spec {
            AddressSpec::Exact(address) => {
                if !is_page_aligned(address) {
                    return Err(VmError::InvalidArgs);
                }
                let end = address.checked_add(size).ok_or(VmError::InvalidArgs)?;
                if address < self.base || end > self.end {
                    return Err(VmError::InvalidArgs);
                }
                if !self.is_range_free(address, end, None, false) {
                    return Err(VmError::AddressInUse);
                }
                Ok(address)
            }
            AddressSpec::Base(hint) => {
                if !is_page_aligned(hint) {
                    return Err(VmError::InvalidArgs);
                }
                self.first_fit(hint, size, true)
                    .or_else(|| self.first_fit(self.base, size, true))
                    .ok_or(VmError::NoVirtualSpace)
            }
            AddressSpec::Any => self
                .first_fit(self.base, size, true)
                .ok_or(VmError::NoVirtualSpace),
        }
    }

    /// 新区域精确放置在保留范围内时，裁掉重叠部分
    pub(crate) fn claim_reserved(&mut self, start: usize, end: usize) {
        let overlapping: Vec<ReservedRange> = self
            .reserved
            .values()
            .filter(|r| r.base < end && start < r.end())
            .copied()
            .collect();
        for range in overlapping {
            self.reserved.remove(&range.base);
            if range.base < start {
                self.reserved.insert(
                    range.base,
                    ReservedRange {
                        base: range.base,
                        size: start - range.base,
                    },
                );
            }
            if range.end() > end {
                self.reserved.insert(
                    end,
                    ReservedRange {
                        base: end,
                        size: range.end() - end,
                    },
                );
            }
        }
    }

    pub(crate) fn add_reserved(&mut self, base: usize, size: usize) {
        self.reserved.insert(base, ReservedRange { base, size });
    }

    /// 移除完全落在 `[start, end)` 内的保留范围，返回移除的个数
    pub(crate) fn remove_reserved(&mut self, start: usize, end: usize) -> usize {
        let before = self.reserved.len();
        self.reserved.retain(|_, r| !(r.base >= start && r.end() <= end));
        before - self.reserved.len()
    }
}
