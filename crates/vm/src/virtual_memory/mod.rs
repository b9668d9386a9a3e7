//! VM 上下文
//!
//! [`VirtualMemory`] 拥有记账器、反向映射表、地址空间表、区域表与缓存
//! 登记表，所有对外操作都以它的方法形式提供：
//! - 区域生命周期：见 `area_ops`
//! - 内存映射查询、锁定与拷贝：见 `memory_ops`
//! - 缺页入口：见 [`crate::fault`]

mod area_ops;
mod memory_ops;

pub use area_ops::AreaBacking;
pub use memory_ops::PhysicalRun;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicU64, Ordering};

use sync::SpinLock;

use crate::accountant::{Accountant, MemoryPriority};
use crate::address::{PAGE_SIZE, Ppn};
use crate::area::{Area, AreaId};
use crate::cache::{Cache, CacheEnv, CacheId, CacheKind, LockedCache};
use crate::config::VmConfig;
use crate::error::{VmError, VmResult};
use crate::fault::FaultStats;
use crate::mapping_table::{MappingTable, PageMapping};
use crate::page::{PageAllocator, PageState};
use crate::platform::VmPlatform;
use crate::space::{AddressSpace, MultiSpaceLocker, SpaceId, SpaceLock, SpaceWriteLocked};
use crate::translation_map::{PageFlags, TranslationMap};

/// 内核地址空间的编号
pub const KERNEL_SPACE_ID: SpaceId = SpaceId(0);

/// VM 上下文
pub struct VirtualMemory {
    config: VmConfig,
    allocator: Arc<dyn PageAllocator>,
    platform: Arc<dyn VmPlatform>,
    accountant: Arc<Accountant>,
    kernel_space: Arc<AddressSpace>,
    spaces: SpinLock<BTreeMap<SpaceId, Arc<AddressSpace>>>,
    area_table: SpinLock<BTreeMap<AreaId, SpaceId>>,
    caches: SpinLock<Vec<Weak<Cache>>>,
    mappings: MappingTable,
    stats: FaultStats,
    next_area_id: AtomicU64,
    next_cache_id: AtomicU64,
}

impl VirtualMemory {
    /// 创建 VM 上下文与内核地址空间
    ///
    /// 记账器的总量取分配器管理的全部物理内存。
    pub fn new(
        config: VmConfig,
        allocator: Arc<dyn PageAllocator>,
        platform: Arc<dyn VmPlatform>,
        kernel_map: Box<dyn TranslationMap>,
    ) -> Self {
        let total = allocator.total_pages() * PAGE_SIZE;
        let accountant = Arc::new(Accountant::new(
            total,
            config.user_reserve,
            config.system_reserve,
            platform.clone(),
        ));
        let kernel_space = AddressSpace::new(
            KERNEL_SPACE_ID,
            config.kernel_base,
            config.kernel_size,
            true,
            kernel_map,
        );
        let mut spaces = BTreeMap::new();
        spaces.insert(KERNEL_SPACE_ID, kernel_space.clone());
        log::debug!(
            "vm: {} pages of physical memory, kernel space [{:#x}, {:#x})",
            allocator.total_pages(),
            kernel_space.base(),
            kernel_space.end()
        );
        Self {
            config,
            allocator,
            platform,
            accountant,
            kernel_space,
            spaces: SpinLock::new(spaces),
            area_table: SpinLock::new(BTreeMap::new()),
            caches: SpinLock::new(Vec::new()),
            mappings: MappingTable::new(),
            stats: FaultStats::new(),
            next_area_id: AtomicU64::new(1),
            next_cache_id: AtomicU64::new(1),
        }
    }

    /// 配置
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// 记账器
    pub fn accountant(&self) -> &Accountant {
        &self.accountant
    }

    /// 物理页分配器
    pub fn allocator(&self) -> &Arc<dyn PageAllocator> {
        &self.allocator
    }

    /// 反向映射表
    pub fn mapping_table(&self) -> &MappingTable {
        &self.mappings
    }

    /// 缺页统计
    pub fn stats(&self) -> &FaultStats {
        &self.stats
    }

    // ========================================================================
    // 地址空间生命周期
    // ========================================================================

    /// 内核地址空间
    pub fn kernel_address_space(&self) -> Arc<AddressSpace> {
        self.kernel_space.clone()
    }

    /// 为 team 创建用户地址空间
    pub fn create_address_space(
        &self,
        team: SpaceId,
        map: Box<dyn TranslationMap>,
    ) -> VmResult<Arc<AddressSpace>> {
        let mut spaces = self.spaces.lock();
        if spaces.contains_key(&team) {
            return Err(VmError::InvalidArgs);
        }
        let space = AddressSpace::new(team, self.config.user_base, self.config.user_size, false, map);
        spaces.insert(team, space.clone());
        log::debug!("vm: created address space {}", team);
        Ok(space)
    }

    /// 按编号查找地址空间；正在销毁的空间查不到
    pub fn address_space(&self, team: SpaceId) -> Option<Arc<AddressSpace>> {
        self.spaces
            .lock()
            .get(&team)
            .filter(|space| !space.is_deleting())
            .cloned()
    }

    /// 销毁用户地址空间
    ///
    /// 先标记为正在销毁，之后删除剩余的全部区域，最后从查找表中移除。
    /// 转换表随最后一个句柄释放。
    pub fn destroy_address_space(&self, space: &Arc<AddressSpace>) -> VmResult<()> {
        if space.is_kernel() {
            return Err(VmError::NotAllowed);
        }
        space.mark_deleting();
        let released: Vec<Area> = {
            let mut locked = space.write_lock();
            let ids: Vec<AreaId> = locked.inner().areas().map(|a| a.id()).collect();
            ids.into_iter()
                .filter_map(|id| self.detach_area(&mut locked, id))
                .collect()
        };
        for area in released {
            self.release_area(area);
        }
        self.spaces.lock().remove(&space.id());
        self.mappings.remove_space(space.id());
        log::debug!("vm: destroyed address space {}", space.id());
        Ok(())
    }

    /// 全部存活的地址空间，按编号排序
    pub fn address_spaces(&self) -> Vec<Arc<AddressSpace>> {
        self.spaces.lock().values().cloned().collect()
    }

    pub(crate) fn space_by_id(&self, id: SpaceId) -> Option<Arc<AddressSpace>> {
        self.spaces.lock().get(&id).cloned()
    }

    /// 区域所在的地址空间
    pub(crate) fn area_space(&self, id: AreaId) -> VmResult<Arc<AddressSpace>> {
        let space = *self.area_table.lock().get(&id).ok_or(VmError::BadArea)?;
        self.space_by_id(space).ok_or(VmError::BadArea)
    }

    pub(crate) fn register_area(&self, id: AreaId, space: SpaceId) {
        self.area_table.lock().insert(id, space);
    }

    pub(crate) fn next_area_id(&self) -> AreaId {
        AreaId(self.next_area_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn priority_for(space: &AddressSpace) -> MemoryPriority {
        if space.is_kernel() {
            MemoryPriority::System
        } else {
            MemoryPriority::User
        }
    }

    pub(crate) fn platform(&self) -> &dyn VmPlatform {
        &*self.platform
    }

    // ========================================================================
    // 缓存
    // ========================================================================

    /// 创建并登记缓存；`committed` 必须已经提交过
    pub(crate) fn new_cache(
        &self,
        kind: CacheKind,
        range: Range<usize>,
        committed: usize,
        priority: MemoryPriority,
    ) -> Arc<Cache> {
        let id = CacheId(self.next_cache_id.fetch_add(1, Ordering::Relaxed));
        let env = CacheEnv {
            allocator: self.allocator.clone(),
            accountant: self.accountant.clone(),
        };
        let cache = Cache::new(id, kind, range, committed, priority, env);
        let mut registry = self.caches.lock();
        registry.retain(|weak| weak.strong_count() > 0);
        registry.push(Arc::downgrade(&cache));
        cache
    }

    /// 全部存活的缓存，按编号排序
    pub fn caches(&self) -> Vec<Arc<Cache>> {
        let mut caches: Vec<Arc<Cache>> = {
            let registry = self.caches.lock();
            registry.iter().filter_map(Weak::upgrade).collect()
        };
        caches.sort_by_key(|c| c.id());
        caches
    }

    // ========================================================================
    // 内部工具
    // ========================================================================

    /// 解除区域内 `[start, end)` 的映射
    ///
    /// `cache` 必须是区域绑定的缓存且已加锁。常驻区域的页在解除映射时
    /// 去掉常驻计数；硬件报告被写过的页标记为已修改。
    pub(crate) fn unmap_range(
        &self,
        space: &AddressSpace,
        area: &Area,
        start: usize,
        end: usize,
        cache: &mut LockedCache,
    ) {
        let unmapped = {
            let mut map = space.map().lock();
            let unmapped = map.unmap(start, end);
            map.flush();
            unmapped
        };
        for page in &unmapped {
            self.mappings
                .remove(page.ppn, PageMapping::new(space.id(), page.address));
            let offset = area.cache_offset_of(page.address);
            let Some(vm_page) = cache.lookup_page_mut(offset) else {
                continue;
            };
            if vm_page.ppn() != page.ppn {
                continue;
            }
            if area.wiring().is_wired() && vm_page.wired_count() > 0 {
                vm_page.unwire();
            }
            if page.flags.contains(PageFlags::MODIFIED) && vm_page.wired_count() == 0 {
                vm_page.set_state(PageState::Modified);
            }
        }
    }

    /// 把区域从地址空间中摘下
    ///
    /// 先从区域表中删除，使之不能再被查到；随后解除映射、从缓存的区域
    /// 列表中删除，最后从地址空间中移除。返回的区域持有缓存句柄，
    /// 调用者应在解锁后交给 [`Self::release_area`]。
    pub(crate) fn detach_area(&self, locked: &mut SpaceWriteLocked, id: AreaId) -> Option<Area> {
        locked.inner().area(id)?;
        self.area_table.lock().remove(&id);
        let area = locked.inner_mut().remove_area(id)?;
        let mut cache = area.cache.lock();
        self.unmap_range(locked.space(), &area, area.base, area.end(), &mut cache);
        cache.remove_area(id);
        drop(cache);
        log::debug!(
            "vm: area {} '{}' [{:#x}, {:#x}) detached from space {}",
            id,
            area.name,
            area.base,
            area.end(),
            area.space
        );
        Some(area)
    }

    /// 释放已摘下的区域：撤销 `lock_memory` 的固定，放开缓存句柄
    ///
    /// 调用者不能持有任何 VM 锁。
    pub(crate) fn release_area(&self, mut area: Area) {
        for range in core::mem::take(&mut area.wired_ranges) {
            for page in range.pages {
                let mut cache = page.cache.lock();
                if let Some(vm_page) = cache.lookup_page_mut(page.offset) {
                    vm_page.unwire();
                }
            }
        }
        drop(area);
    }

    /// 锁住区域所在缓存，以及绑定到该缓存的全部区域所在的地址空间
    ///
    /// 地址空间必须先于缓存加锁，所以先读出缓存、放开，再按顺序加锁并
    /// 重新验证：区域仍绑定在同一缓存上，且缓存的区域都在已加锁的空间里。
    /// 否则重试。`extra` 是需要一起加锁的额外地址空间。
    pub(crate) fn lock_area_cache_and_spaces(
        &self,
        id: AreaId,
        extra: Option<&Arc<AddressSpace>>,
    ) -> VmResult<(MultiSpaceLocker, LockedCache, SpaceId)> {
        loop {
            let space = self.area_space(id)?;
            let cache = {
                let locked = space.read_lock();
                locked.inner().area(id).ok_or(VmError::BadArea)?.cache.clone()
            };
            let mut spaces: Vec<Arc<AddressSpace>> = {
                let locked_cache = cache.lock();
                locked_cache
                    .areas()
                    .iter()
                    .filter_map(|link| self.space_by_id(link.space))
                    .collect()
            };
            spaces.push(space.clone());
            if let Some(extra) = extra {
                spaces.push(extra.clone());
            }

            let locker = MultiSpaceLocker::lock(spaces);
            let locked_cache = cache.lock();
            let still_bound = locker
                .get(space.id())
                .and_then(|locked| locked.inner().area(id))
                .is_some_and(|area| Arc::ptr_eq(&area.cache, &cache));
            let covered = locked_cache
                .areas()
                .iter()
                .all(|link| locker.contains(link.space));
            if still_bound && covered {
                return Ok((locker, locked_cache, space.id()));
            }
            drop(locked_cache);
            drop(locker);
            if self.area_space(id).is_err() {
                return Err(VmError::BadArea);
            }
            log::trace!("vm: area {} changed cache while locking, retrying", id);
        }
    }

    /// 写锁住绑定在 `cache` 上的全部区域所在的地址空间，再锁住 `cache`
    ///
    /// 加锁期间区域集合变化时重试。
    pub(crate) fn lock_cache_and_spaces(&self, cache: &Arc<Cache>) -> (MultiSpaceLocker, LockedCache) {
        loop {
            let spaces: Vec<Arc<AddressSpace>> = cache
                .lock()
                .areas()
                .iter()
                .filter_map(|link| self.space_by_id(link.space))
                .collect();
            let locker = MultiSpaceLocker::lock(spaces);
            let locked_cache = cache.lock();
            if locked_cache
                .areas()
                .iter()
                .all(|link| locker.contains(link.space))
            {
                return (locker, locked_cache);
            }
            drop(locked_cache);
            drop(locker);
            log::trace!("vm: areas of cache {} changed while locking, retrying", cache.id());
        }
    }

    /// 解除另一个区域对 `ppn` 的陈旧映射
    ///
    /// 只需要转换表锁与反向映射表锁，可以在持有缓存锁时调用。
    pub(crate) fn unmap_stale_mapping(&self, mapping: PageMapping, ppn: Ppn) {
        if let Some(space) = self.space_by_id(mapping.space) {
            let mut map = space.map().lock();
            if map.query(mapping.address).is_some_and(|info| info.ppn == ppn) {
                map.unmap(mapping.address, mapping.address + PAGE_SIZE);
                map.flush();
            }
        }
        self.mappings.remove(ppn, mapping);
    }

    /// 硬件报告存在的页必须是分配器已知且未释放的页，否则内存已被破坏
    pub(crate) fn check_page_known(&self, ppn: Ppn, space: SpaceId, address: usize) {
        if self.allocator.lookup_page(ppn) == Some(PageState::Free) {
            log::error!(
                "vm: page {} mapped at {:#x} in space {} is free in the allocator",
                ppn,
                address,
                space
            );
            panic!(
                "vm: mapped page {} at {:#x} (space {}) is free in the page allocator",
                ppn, address, space
            );
        }
    }
}
