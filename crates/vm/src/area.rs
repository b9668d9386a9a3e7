//! 区域
//!
//! 地址空间中的一段连续虚拟范围，绑定到某个缓存的某个偏移，
//! 带有自己的保护位与常驻策略。

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use uapi::area::{AreaProtection, WiringMode};

use crate::address::{pages_between, pages_in};
use crate::cache::{AreaLink, Cache, CacheId, CacheKindTag};
use crate::space::SpaceId;

/// 区域编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AreaId(pub u64);

impl fmt::Display for AreaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 被 `lock_memory` 固定的一页
#[derive(Debug, Clone)]
pub(crate) struct WiredPage {
    pub(crate) cache: Arc<Cache>,
    pub(crate) offset: usize,
}

/// 被 `lock_memory` 固定的一段范围
#[derive(Debug, Clone)]
pub(crate) struct WiredRange {
    pub(crate) base: usize,
    pub(crate) size: usize,
    pub(crate) pages: Vec<WiredPage>,
}

impl WiredRange {
    pub(crate) fn end(&self) -> usize {
        self.base + self.size
    }

    pub(crate) fn overlaps(&self, start: usize, end: usize) -> bool {
        self.base < end && start < self.end()
    }
}

/// 区域
pub struct Area {
    pub(crate) id: AreaId,
    pub(crate) name: String,
    pub(crate) space: SpaceId,
    pub(crate) base: usize,
    pub(crate) size: usize,
    pub(crate) protection: AreaProtection,
    pub(crate) wiring: WiringMode,
    pub(crate) cache: Arc<Cache>,
    pub(crate) cache_offset: usize,
    pub(crate) page_protections: Option<Vec<AreaProtection>>,
    pub(crate) wired_ranges: Vec<WiredRange>,
}

impl Area {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: AreaId,
        name: &str,
        space: SpaceId,
        base: usize,
        size: usize,
        protection: AreaProtection,
        wiring: WiringMode,
        cache: Arc<Cache>,
        cache_offset: usize,
    ) -> Self {
        Self {
            id,
            name: String::from(name),
            space,
            base,
            size,
            protection,
            wiring,
            cache,
            cache_offset,
            page_protections: None,
            wired_ranges: Vec::new(),
        }
    }

    /// 编号
    pub fn id(&self) -> AreaId {
        self.id
    }

    /// 名称
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 所在地址空间
    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// 起始地址
    pub fn base(&self) -> usize {
        self.base
    }

    /// 大小
    pub fn size(&self) -> usize {
        self.size
    }

    /// 结束地址（不含）
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// 区域级保护位
    pub fn protection(&self) -> AreaProtection {
        self.protection
    }

    /// 常驻策略
    pub fn wiring(&self) -> WiringMode {
        self.wiring
    }

    /// 绑定的缓存
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// 区域起点对应的缓存偏移
    pub fn cache_offset(&self) -> usize {
        self.cache_offset
    }

    /// 缓存种类标签
    pub fn cache_kind(&self) -> CacheKindTag {
        self.cache.tag()
    }

    /// 是否包含地址
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.end()
    }

    /// 与 `[start, end)` 是否相交
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.base < end && start < self.end()
    }

    /// 地址处的有效保护位（考虑逐页覆盖）
    pub fn page_protection(&self, address: usize) -> AreaProtection {
        match &self.page_protections {
            Some(table) => table[pages_in(address - self.base)],
            None => self.protection,
        }
    }

    /// 地址对应的缓存偏移
    pub fn cache_offset_of(&self, address: usize) -> usize {
        self.cache_offset + (address - self.base)
    }

    pub(crate) fn link(&self) -> AreaLink {
        AreaLink {
            space: self.space,
            area: self.id,
            base: self.base,
            size: self.size,
            cache_offset: self.cache_offset,
        }
    }

    /// `[start, end)` 内是否有被固定的内存
    pub(crate) fn has_wired_range_in(&self, start: usize, end: usize) -> bool {
        self.wired_ranges.iter().any(|r| r.overlaps(start, end))
    }

    /// 取出与 `[start, end)` 相交的固定范围
    pub(crate) fn take_wired_ranges_in(&mut self, start: usize, end: usize) -> Vec<WiredRange> {
        let (taken, kept): (Vec<WiredRange>, Vec<WiredRange>) = core::mem::take(&mut self.wired_ranges)
            .into_iter()
            .partition(|r| r.overlaps(start, end));
        self.wired_ranges = kept;
        taken
    }

    /// 固定页迁移到新缓存后更新记录
    pub(crate) fn retarget_wired_pages(&mut self, from: &Arc<Cache>, to: &Arc<Cache>, offsets: &[usize]) {
        for page in self.wired_ranges.iter_mut().flat_map(|r| r.pages.iter_mut()) {
            if Arc::ptr_eq(&page.cache, from) && offsets.contains(&page.offset) {
                page.cache = to.clone();
            }
        }
    }

    /// 设置 `[start, end)` 的逐页保护位
    pub(crate) fn set_page_protection(&mut self, start: usize, end: usize, protection: AreaProtection) {
        let pages = pages_in(self.size);
        let base_protection = self.protection;
        let table = self
            .page_protections
            .get_or_insert_with(|| alloc::vec![base_protection; pages]);
        let first = pages_in(start - self.base);
        let last = pages_in(end - self.base);
        for slot in &mut table[first..last] {
            *slot = protection;
        }
    }

    /// 设置区域级保护位并清除逐页覆盖
    pub(crate) fn set_protection(&mut self, protection: AreaProtection) {
        self.protection = protection;
        self.page_protections = None;
    }

    /// 调整大小（尾部）
    pub(crate) fn set_size(&mut self, size: usize) {
        if let Some(table) = &mut self.page_protections {
            table.resize(pages_in(size), self.protection);
        }
        self.size = size;
    }

    /// 从头部切掉 `delta` 字节
    pub(crate) fn shrink_head(&mut self, delta: usize) {
        if let Some(table) = &mut self.page_protections {
            table.drain(..pages_in(delta));
        }
        self.base += delta;
        self.size -= delta;
        self.cache_offset += delta;
    }

    /// 挖掉 `[cut_start, cut_end)`，本区域保留前半段，返回后半段
    pub(crate) fn split_off(&mut self, cut_start: usize, cut_end: usize, new_id: AreaId) -> Area {
        debug_assert!(self.base < cut_start && cut_end < self.end());
        let head = cut_start - self.base;
        let skip = cut_end - self.base;
        let second_protections = self.page_protections.as_mut().map(|table| {
            let tail = table.split_off(pages_in(skip));
            table.truncate(pages_in(head));
            tail
        });
        let (second_ranges, first_ranges): (Vec<_>, Vec<_>) = core::mem::take(&mut self.wired_ranges)
            .into_iter()
            .partition(|r| r.base >= cut_end);
        self.wired_ranges = first_ranges;

        let second = Area {
            id: new_id,
            name: self.name.clone(),
            space: self.space,
            base: cut_end,
            size: self.end() - cut_end,
            protection: self.protection,
            wiring: self.wiring,
            cache: self.cache.clone(),
            cache_offset: self.cache_offset + skip,
            page_protections: second_protections,
            wired_ranges: second_ranges,
        };
        self.size = head;
        second
    }

    /// 区域内的页地址
    pub(crate) fn page_addresses(&self) -> impl Iterator<Item = usize> {
        pages_between(self.base, self.end())
    }
}

impl fmt::Debug for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Area")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .field("protection", &self.protection)
            .field("wiring", &self.wiring)
            .field("cache", &self.cache.id())
            .finish()
    }
}

/// 区域信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaInfo {
    /// 编号
    pub id: AreaId,
    /// 名称
    pub name: String,
    /// 所在地址空间
    pub space: SpaceId,
    /// 起始地址
    pub base: usize,
    /// 大小
    pub size: usize,
    /// 保护位
    pub protection: AreaProtection,
    /// 常驻策略
    pub wiring: WiringMode,
    /// 顶层缓存
    pub cache: CacheId,
    /// 顶层缓存种类
    pub cache_kind: CacheKindTag,
    /// 区域范围内驻留在顶层缓存中的字节数
    pub ram_size: usize,
    /// 缓存链深度
    pub copy_depth: usize,
    /// 被 `lock_memory` 固定的范围数
    pub wired_ranges: usize,
}
