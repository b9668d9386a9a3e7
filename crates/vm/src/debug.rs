//! 调试输出
//!
//! 文本格式与 procfs 相近：区域列表类似 `/proc/<pid>/maps`，统计类似
//! `/proc/meminfo`。

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;

use uapi::area::AreaProtection;

use crate::address::PAGE_SIZE;
use crate::cache::Cache;
use crate::fault::FaultStatsSnapshot;
use crate::space::{AddressSpace, SpaceLock};
use crate::virtual_memory::VirtualMemory;

/// 全局内存统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmStats {
    /// 物理页总数
    pub total_pages: usize,
    /// 空闲物理页数
    pub free_pages: usize,
    /// 记账器可用字节数
    pub available: usize,
    /// 记账器欠缺字节数
    pub needed: usize,
    /// 全部缓存的已提交字节数
    pub committed: usize,
    /// 存活的缓存数
    pub cache_count: usize,
    /// 缓存中的页数
    pub cached_pages: usize,
    /// 被固定的缓存页数
    pub wired_pages: usize,
    /// 反向映射表中的物理页数
    pub mapped_pages: usize,
    /// 缺页统计
    pub faults: FaultStatsSnapshot,
}

impl VirtualMemory {
    /// 统计快照
    pub fn vm_stats(&self) -> VmStats {
        let mut committed = 0;
        let mut cached_pages = 0;
        let mut wired_pages = 0;
        let caches = self.caches();
        for cache in &caches {
            let locked = cache.lock();
            committed += locked.committed();
            cached_pages += locked.page_count();
            wired_pages += locked
                .pages_in(locked.virtual_base(), locked.virtual_end())
                .filter(|(_, page)| page.wired_count() > 0)
                .count();
        }
        let account = self.accountant().snapshot();
        VmStats {
            total_pages: self.allocator().total_pages(),
            free_pages: self.allocator().free_pages(),
            available: account.available,
            needed: account.needed,
            committed,
            cache_count: caches.len(),
            cached_pages,
            wired_pages,
            mapped_pages: self.mapping_table().len(),
            faults: self.stats().snapshot(),
        }
    }
}

/// 地址空间的区域列表，每行一个区域
///
/// `起始-结束 保护位 常驻策略 缓存种类 缓存编号 名称`，保护位为
/// `rwx` 加上 `s`（共享缓存）或 `p`（私有）。
pub fn format_areas(space: &Arc<AddressSpace>) -> String {
    let locked = space.read_lock();
    let mut out = String::new();
    for area in locked.inner().areas() {
        let protection = area.protection();
        let shared = area.cache().info().area_count > 1;
        let perm = format!(
            "{}{}{}{}",
            if protection.contains(AreaProtection::READ) { 'r' } else { '-' },
            if protection.contains(AreaProtection::WRITE) { 'w' } else { '-' },
            if protection.contains(AreaProtection::EXECUTE) { 'x' } else { '-' },
            if shared { 's' } else { 'p' },
        );
        out.push_str(&format!(
            "{:016x}-{:016x} {} {:>5} {:>6} {:>6} {}\n",
            area.base(),
            area.end(),
            perm,
            area.wiring().as_str(),
            area.cache_kind().as_str(),
            area.cache().id().0,
            area.name()
        ));
    }
    out
}

/// 从给定缓存开始沿 source 链向下的描述，每层一行，逐层缩进
pub fn format_cache_chain(cache: &Arc<Cache>) -> String {
    let mut out = String::new();
    let mut depth = 0;
    let mut next = Some(cache.clone());
    while let Some(current) = next {
        let info = current.info();
        out.push_str(&format!(
            "{:indent$}cache {} {} [{:#x}, {:#x}) pages {} busy {} committed {:#x} refs {} consumers {} areas {}\n",
            "",
            info.id,
            info.kind.as_str(),
            info.virtual_base,
            info.virtual_end,
            info.page_count,
            info.busy_pages,
            info.committed,
            info.ref_count,
            info.consumer_count,
            info.area_count,
            indent = depth * 2
        ));
        depth += 1;
        next = current.source();
    }
    out
}

/// `meminfo` 风格的统计文本
pub fn format_meminfo(stats: &VmStats) -> String {
    let kb = |pages: usize| pages * PAGE_SIZE / 1024;
    let bytes_kb = |bytes: usize| bytes / 1024;
    format!(
        "MemTotal:       {:>8} kB
MemFree:        {:>8} kB
MemAvailable:   {:>8} kB
MemNeeded:      {:>8} kB
Committed:      {:>8} kB
Cached:         {:>8} kB
Wired:          {:>8} kB
Mapped:         {:>8} kB
Caches:         {:>8}
PageFaults:     {:>8}
CopyOnWrite:    {:>8}
ZeroFill:       {:>8}
PageIn:         {:>8}
FaultRestarts:  {:>8}
FaultFailures:  {:>8}
",
        kb(stats.total_pages),
        kb(stats.free_pages),
        bytes_kb(stats.available),
        bytes_kb(stats.needed),
        bytes_kb(stats.committed),
        kb(stats.cached_pages),
        kb(stats.wired_pages),
        kb(stats.mapped_pages),
        stats.cache_count,
        stats.faults.total,
        stats.faults.copy_on_write,
        stats.faults.zero_fill,
        stats.faults.page_in,
        stats.faults.restarts,
        stats.faults.failures,
    )
}
