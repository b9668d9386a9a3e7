//! 区域生命周期
//!
//! 创建、删除、调整大小、切割、克隆、转移、复制以及保护位修改。
//!
//! 结构修改都在地址空间写锁下进行；可能阻塞的准备工作（提交内存、
//! 预留物理页）在加锁之前完成，失败时不留下任何可见的中间状态。

use alloc::sync::Arc;
use alloc::vec::Vec;

use uapi::area::{AddressSpec, AreaProtection, WiringMode};

use crate::accountant::MemoryPriority;
use crate::address::{PAGE_SIZE, Ppn, is_page_aligned, page_align_down, page_align_up, pages_in};
use crate::area::{Area, AreaId, AreaInfo};
use crate::cache::{AreaLink, BackingStore, Cache, CacheKind, LockedCache};
use crate::error::{VmError, VmResult};
use crate::mapper::MappingKind;
use crate::mapping_table::PageMapping;
use crate::page::{ContiguousRun, PageReservation, PageState, ReserveMode, VmPage};
use crate::space::{AddressSpace, MultiSpaceLocker, SpaceId, SpaceLock, SpaceWriteLocked};

use super::VirtualMemory;

/// 新区域的后备
#[derive(Debug, Clone)]
pub enum AreaBacking {
    /// 匿名内存
    Anonymous,
    /// 只占位，任何访问都失败
    Null,
    /// 从给定物理页开始的物理内存（设备寄存器、帧缓冲等）
    Physical(Ppn),
    /// 已有的缓存，例如 [`VirtualMemory::file_cache`] 返回的文件缓存
    Cache {
        /// 源缓存
        cache: Arc<Cache>,
        /// 私有或共享
        mapping: MappingKind,
    },
}

impl VirtualMemory {
    fn check_protection(&self, protection: AreaProtection) -> VmResult<AreaProtection> {
        let protection = protection.with_kernel_access();
        if !self.config.supported_protection.contains(protection) {
            return Err(VmError::InvalidArgs);
        }
        Ok(protection)
    }

    /// 匿名源缓存上是否绑定了可写区域（区域保护位或逐页覆盖）
    ///
    /// 是的话，在它之上叠加私有层前必须先做写时复制提升，否则源的写入
    /// 会透过父缓存被私有层看到。
    fn needs_promotion(locker: &MultiSpaceLocker, cache: &LockedCache) -> bool {
        if !matches!(cache.cache().kind(), CacheKind::Anonymous { .. }) {
            return false;
        }
        cache.areas().iter().any(|link| {
            locker
                .get(link.space)
                .and_then(|locked| locked.inner().area(link.area))
                .is_some_and(|area| {
                    area.protection.is_writable()
                        || area
                            .page_protections
                            .as_ref()
                            .is_some_and(|table| table.iter().any(|p| p.is_writable()))
                })
        })
    }

    /// 在已确定的位置插入区域；精确放置时收回与之重叠的保留范围
    fn insert_placed(&self, locked: &mut SpaceWriteLocked, area: Area, spec: AddressSpec) {
        let (id, base, end) = (area.id, area.base, area.end());
        locked.inner_mut().insert_area(area);
        if let AddressSpec::Exact(_) = spec {
            locked.inner_mut().claim_reserved(base, end);
        }
        self.register_area(id, locked.space().id());
    }

    // ========================================================================
    // 创建与删除
    // ========================================================================

    /// 创建区域
    ///
    /// `offset` 只对 [`AreaBacking::Cache`] 有意义，是区域起点对应的源缓存偏移。
    ///
    /// 全部常驻与连续常驻的区域在加锁前预留全部物理页与页表页，随后在
    /// 写锁下立即填充并固定；物理内存区域立即映射。任何一步失败都会撤销
    /// 之前的步骤。
    #[allow(clippy::too_many_arguments)]
    pub fn create_area(
        &self,
        space: &Arc<AddressSpace>,
        name: &str,
        spec: AddressSpec,
        size: usize,
        wiring: WiringMode,
        protection: AreaProtection,
        backing: AreaBacking,
        offset: usize,
    ) -> VmResult<AreaId> {
        if size == 0 || !is_page_aligned(size) || !is_page_aligned(offset) {
            return Err(VmError::InvalidArgs);
        }
        let protection = self.check_protection(protection)?;
        match (&backing, wiring) {
            (AreaBacking::Anonymous, WiringMode::AlreadyWired) if !space.is_kernel() => {
                return Err(VmError::NotAllowed);
            }
            (AreaBacking::Anonymous, _) => {}
            (AreaBacking::Null, WiringMode::NoLock) => {}
            (AreaBacking::Physical(_), WiringMode::NoLock | WiringMode::FullLock) => {}
            (AreaBacking::Cache { .. }, WiringMode::NoLock | WiringMode::LazyLock) => {}
            _ => return Err(VmError::InvalidArgs),
        }
        if space.is_deleting() {
            return Err(VmError::BadSpace);
        }

        let priority = Self::priority_for(space);
        let (cache, cache_offset) = match &backing {
            AreaBacking::Anonymous => {
                let overcommit = !wiring.is_wired();
                let committed = if overcommit {
                    0
                } else {
                    self.accountant
                        .reserve(size, priority, self.config.commit_timeout)?;
                    size
                };
                let cache = self.new_cache(CacheKind::Anonymous { overcommit }, 0..size, committed, priority);
                (cache, 0)
            }
            AreaBacking::Null => (self.new_cache(CacheKind::Null, 0..size, 0, priority), 0),
            AreaBacking::Physical(base) => (
                self.new_cache(CacheKind::Device { base: *base }, 0..size, 0, priority),
                0,
            ),
            AreaBacking::Cache { cache, mapping } => {
                let end = offset.checked_add(size).ok_or(VmError::InvalidArgs)?;
                let (mut locker, mut source) = self.lock_cache_and_spaces(cache);
                if offset < source.virtual_base() || end > source.virtual_end() {
                    return Err(VmError::InvalidArgs);
                }
                if *mapping == MappingKind::Private && Self::needs_promotion(&locker, &source) {
                    self.promote_to_copy_on_write(&mut locker, &mut source)?;
                }
                (self.attach(&mut source, offset, size, *mapping, priority)?, offset)
            }
        };

        // 加锁前预留：页表页按最坏情况估计，放置后再按实际地址补足
        let table_pages = space.map().lock().max_pages_need(0, size);
        let mut run = None;
        let data_pages = match (&backing, wiring) {
            (AreaBacking::Anonymous, WiringMode::FullLock) => pages_in(size),
            (AreaBacking::Anonymous, WiringMode::Contiguous) => {
                run = Some(ContiguousRun::allocate(self.allocator.clone(), None, pages_in(size))?);
                0
            }
            _ => 0,
        };
        let eager = data_pages > 0
            || run.is_some()
            || matches!(backing, AreaBacking::Physical(_));
        let mut reservation = if eager {
            PageReservation::reserve(
                self.allocator.clone(),
                self.platform(),
                data_pages + table_pages,
                ReserveMode::WaitFor(self.config.commit_timeout),
            )?
        } else {
            PageReservation::empty(self.allocator.clone())
        };

        let mut locked = space.write_lock();
        if space.is_deleting() {
            return Err(VmError::BadSpace);
        }
        let base = locked.inner().find_placement(spec, size)?;
        if eager {
            let exact = space.map().lock().max_pages_need(base, base + size);
            reservation.top_up(self.platform(), data_pages + exact, ReserveMode::NoWait)?;
        }

        let id = self.next_area_id();
        let area = Area::new(id, name, space.id(), base, size, protection, wiring, cache.clone(), cache_offset);
        let link = area.link();
        locked.inner_mut().insert_area(area);
        self.register_area(id, space.id());
        cache.lock().add_area(link);
        drop(cache);

        if let Err(err) = self.populate_area(&locked, id, run.as_mut(), &mut reservation) {
            log::debug!("vm: populating area '{}' failed: {}", name, err);
            let detached = self.detach_area(&mut locked, id);
            drop(locked);
            if let Some(area) = detached {
                self.release_area(area);
            }
            return Err(err);
        }
        if let AddressSpec::Exact(_) = spec {
            locked.inner_mut().claim_reserved(base, base + size);
        }
        log::debug!(
            "vm: area {} '{}' [{:#x}, {:#x}) {} created in space {}",
            id,
            name,
            base,
            base + size,
            wiring.as_str(),
            space.id()
        );
        Ok(id)
    }

    /// 立即填充需要常驻或直接映射的区域
    fn populate_area(
        &self,
        locked: &SpaceWriteLocked,
        id: AreaId,
        mut run: Option<&mut ContiguousRun>,
        reservation: &mut PageReservation,
    ) -> VmResult<()> {
        let space = locked.space();
        let area = locked.inner().area(id).ok_or(VmError::BadArea)?;
        let mut cache = area.cache.lock();

        if let CacheKind::Device { base } = cache.cache().kind() {
            let base = *base;
            let mut map = space.map().lock();
            for (index, address) in area.page_addresses().enumerate() {
                map.map(address, base + index, area.protection, reservation)?;
            }
            map.flush();
            return Ok(());
        }

        match area.wiring {
            WiringMode::FullLock | WiringMode::Contiguous => {
                for address in area.page_addresses() {
                    let ppn = match run.as_deref_mut() {
                        Some(run) => {
                            let ppn = run.next_page().ok_or(VmError::NoMemory)?;
                            self.allocator.clear_page(ppn);
                            ppn
                        }
                        None => reservation.take().ok_or(VmError::NoMemory)?,
                    };
                    let mut page = VmPage::new(ppn, PageState::Active);
                    page.wire();
                    cache.insert_page(area.cache_offset_of(address), page);
                    space
                        .map()
                        .lock()
                        .map(address, ppn, area.protection, reservation)?;
                    self.mappings.add(ppn, PageMapping::new(space.id(), address));
                }
                space.map().lock().flush();
            }
            WiringMode::AlreadyWired => {
                let map = space.map().lock();
                for address in area.page_addresses() {
                    let Some(info) = map.query(address) else {
                        continue;
                    };
                    self.check_page_known(info.ppn, space.id(), address);
                    let mut page = VmPage::new(info.ppn, PageState::Active);
                    page.wire();
                    cache.insert_page(area.cache_offset_of(address), page);
                    self.mappings.add(info.ppn, PageMapping::new(space.id(), address));
                }
            }
            WiringMode::NoLock | WiringMode::LazyLock => {}
        }
        Ok(())
    }

    /// 删除区域
    ///
    /// 不会因为映射状态失败；只在区域不属于该地址空间时返回 [`VmError::BadArea`]。
    pub fn delete_area(&self, space: &Arc<AddressSpace>, id: AreaId) -> VmResult<()> {
        let area = {
            let mut locked = space.write_lock();
            self.detach_area(&mut locked, id).ok_or(VmError::BadArea)?
        };
        self.release_area(area);
        Ok(())
    }

    // ========================================================================
    // 调整大小与切割
    // ========================================================================

    /// 调整区域大小，绑定在同一缓存上的全部区域一起调整
    ///
    /// 增长先在缓存上尝试（失败时没有区域被改动），再逐个调整区域；
    /// 中途失败时已调整的区域恢复原大小。缩小先解除所有区域尾部的映射，
    /// 最后缩小缓存。
    pub fn resize_area(&self, id: AreaId, new_size: usize) -> VmResult<()> {
        if new_size == 0 || !is_page_aligned(new_size) {
            return Err(VmError::InvalidArgs);
        }
        let (mut locker, mut cache, _) = self.lock_area_cache_and_spaces(id, None)?;
        if !matches!(cache.cache().kind(), CacheKind::Anonymous { .. }) {
            return Err(VmError::NotAllowed);
        }
        let links: Vec<AreaLink> = cache.areas().to_vec();
        let cache_base = cache.virtual_base();
        for link in &links {
            let area = locker
                .get(link.space)
                .and_then(|locked| locked.inner().area(link.area))
                .ok_or(VmError::BadArea)?;
            if area.cache_offset != cache_base || area.wiring.is_wired() {
                return Err(VmError::NotAllowed);
            }
        }

        let old_end = cache.virtual_end();
        let new_end = cache_base.checked_add(new_size).ok_or(VmError::InvalidArgs)?;
        if new_end < old_end && cache.has_consumers() {
            return Err(VmError::NotAllowed);
        }
        let grows = new_end > old_end;
        if grows {
            cache.resize(new_end)?;
        }

        let mut resized: Vec<(SpaceId, AreaId, usize)> = Vec::new();
        let mut failure = None;
        for link in &links {
            let Some(locked) = locker.get_mut(link.space) else {
                continue;
            };
            match locked.inner_mut().resize_area(link.area, new_size) {
                Ok(old_size) => resized.push((link.space, link.area, old_size)),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = failure {
            for (space, area, old_size) in resized.iter().rev() {
                let restored = locker
                    .get_mut(*space)
                    .map(|locked| locked.inner_mut().resize_area(*area, *old_size));
                if !matches!(restored, Some(Ok(_))) {
                    log::error!("vm: cannot restore area {} to {:#x} bytes", area, old_size);
                    panic!(
                        "vm: rollback of area {} to {:#x} bytes failed after an aborted resize",
                        area, old_size
                    );
                }
            }
            if grows {
                cache.resize(old_end)?;
            }
            log::debug!("vm: resize of area {} to {:#x} failed: {}", id, new_size, err);
            return Err(err);
        }

        if new_end < old_end {
            for link in &links {
                let Some(locked) = locker.get(link.space) else {
                    continue;
                };
                let Some(area) = locked.inner().area(link.area) else {
                    continue;
                };
                self.unmap_range(
                    locked.space(),
                    area,
                    link.base + new_size,
                    link.base + link.size,
                    &mut cache,
                );
            }
            cache.resize(new_end)?;
        }
        for link in &links {
            cache.update_area(AreaLink {
                size: new_size,
                ..link.clone()
            });
        }
        log::debug!(
            "vm: cache {} resized to {:#x} bytes ({} areas)",
            cache.cache().id(),
            new_size,
            links.len()
        );
        Ok(())
    }

    /// 从区域中切掉 `[start, end)`
    ///
    /// 覆盖整个区域时删除它；只碰到一端时原地缩小；严格位于内部时
    /// 拆成共享同一缓存的两个区域。
    pub fn cut_area(&self, space: &Arc<AddressSpace>, id: AreaId, start: usize, end: usize) -> VmResult<()> {
        if !is_page_aligned(start) || !is_page_aligned(end) || start >= end {
            return Err(VmError::InvalidArgs);
        }
        let released = {
            let mut locked = space.write_lock();
            self.cut_area_locked(&mut locked, id, start, end)?
        };
        if let Some(area) = released {
            self.release_area(area);
        }
        Ok(())
    }

    /// 解除 `[address, address + size)` 内的全部映射，按需切割相交的区域
    pub fn unmap_memory(&self, space: &Arc<AddressSpace>, address: usize, size: usize) -> VmResult<()> {
        if !is_page_aligned(address) || size == 0 {
            return Err(VmError::InvalidArgs);
        }
        let size = page_align_up(size).ok_or(VmError::InvalidArgs)?;
        let end = address.checked_add(size).ok_or(VmError::InvalidArgs)?;
        let released = {
            let mut locked = space.write_lock();
            let ids = locked.inner().overlapping(address, end);
            let busy = ids.iter().any(|id| {
                locked
                    .inner()
                    .area(*id)
                    .is_some_and(|area| area.has_wired_range_in(address, end))
            });
            if busy {
                return Err(VmError::Busy);
            }
            let mut released = Vec::new();
            for id in ids {
                if let Some(area) = self.cut_area_locked(&mut locked, id, address, end)? {
                    released.push(area);
                }
            }
            released
        };
        for area in released {
            self.release_area(area);
        }
        Ok(())
    }

    /// 持有写锁时切割；整个区域被切掉时返回摘下的区域
    fn cut_area_locked(
        &self,
        locked: &mut SpaceWriteLocked,
        id: AreaId,
        start: usize,
        end: usize,
    ) -> VmResult<Option<Area>> {
        let (base, area_end, cache_offset, cache) = {
            let area = locked.inner().area(id).ok_or(VmError::BadArea)?;
            if area.has_wired_range_in(start, end) {
                return Err(VmError::Busy);
            }
            (area.base, area.end(), area.cache_offset, area.cache.clone())
        };
        let start = start.max(base);
        let end = end.min(area_end);
        if start >= end {
            return Ok(None);
        }
        if start == base && end == area_end {
            return Ok(self.detach_area(locked, id));
        }

        let space = locked.space().clone();
        let mut locked_cache = cache.lock();
        // 缓存只服务于这个区域时，被切掉部分的页可以直接释放
        let sole = matches!(cache.kind(), CacheKind::Anonymous { .. })
            && locked_cache.areas().len() == 1
            && !locked_cache.has_consumers();
        if let Some(area) = locked.inner().area(id) {
            self.unmap_range(&space, area, start, end, &mut locked_cache);
        }
        let cut_offset = cache_offset + (start - base);
        let cut_end_offset = cache_offset + (end - base);

        if end == area_end {
            locked.inner_mut().resize_area(id, start - base)?;
            if sole && locked_cache.virtual_end() == cache_offset + (area_end - base) {
                locked_cache.resize(cut_offset)?;
            }
        } else if start == base {
            locked.inner_mut().shrink_area_head(id, end - base);
            if sole && locked_cache.virtual_base() == cache_offset {
                locked_cache.rebase(cut_end_offset)?;
            }
        } else {
            let new_id = self.next_area_id();
            let second = locked
                .inner_mut()
                .split_area(id, start, end, new_id)
                .ok_or(VmError::BadArea)?
                .link();
            self.register_area(new_id, space.id());
            locked_cache.add_area(second);
            if sole {
                locked_cache.discard_range(cut_offset, cut_end_offset);
            }
        }
        if let Some(area) = locked.inner().area(id) {
            locked_cache.update_area(area.link());
        }
        drop(locked_cache);
        log::debug!(
            "vm: cut [{:#x}, {:#x}) out of area {} in space {}",
            start,
            end,
            id,
            space.id()
        );
        Ok(None)
    }

    // ========================================================================
    // 跨地址空间
    // ========================================================================

    /// 克隆区域到 `target`
    ///
    /// 共享克隆绑定同一缓存；私有克隆在源缓存之上叠加写时复制层，
    /// 源缓存上有可写区域时先做写时复制提升，之后源的写入对副本不可见。
    /// 设备内存与已常驻的页在共享克隆中立即映射。
    #[allow(clippy::too_many_arguments)]
    pub fn clone_area(
        &self,
        target: &Arc<AddressSpace>,
        name: &str,
        spec: AddressSpec,
        protection: AreaProtection,
        mapping: MappingKind,
        source: AreaId,
    ) -> VmResult<AreaId> {
        let protection = self.check_protection(protection)?;
        // 共享克隆立即映射常驻页，页表页在加锁前按最坏情况预留
        let mut reservation = if mapping == MappingKind::Shared {
            let estimate = self.get_area_info(source)?.size;
            PageReservation::reserve(
                self.allocator.clone(),
                self.platform(),
                target.map().lock().max_pages_need(0, estimate),
                ReserveMode::WaitFor(self.config.commit_timeout),
            )?
        } else {
            PageReservation::empty(self.allocator.clone())
        };
        let (mut locker, mut cache, source_space) = self.lock_area_cache_and_spaces(source, Some(target))?;
        if target.is_deleting() {
            return Err(VmError::BadSpace);
        }
        let (size, offset) = {
            let area = locker
                .get(source_space)
                .and_then(|locked| locked.inner().area(source))
                .ok_or(VmError::BadArea)?;
            (area.size, area.cache_offset)
        };
        // 可写的共享绑定会让修改漏进依赖这个缓存的写时复制副本
        if mapping == MappingKind::Shared
            && protection.is_writable()
            && cache.has_consumers()
            && matches!(cache.cache().kind(), CacheKind::Anonymous { .. })
        {
            return Err(VmError::NotAllowed);
        }

        let base = locker
            .get(target.id())
            .ok_or(VmError::BadSpace)?
            .inner()
            .find_placement(spec, size)?;
        if mapping == MappingKind::Shared {
            let exact = target.map().lock().max_pages_need(base, base + size);
            reservation.top_up(self.platform(), exact, ReserveMode::NoWait)?;
        } else if Self::needs_promotion(&locker, &cache) {
            self.promote_to_copy_on_write(&mut locker, &mut cache)?;
        }

        let bound = self.attach(&mut cache, offset, size, mapping, Self::priority_for(target))?;
        let id = self.next_area_id();
        let area = Area::new(id, name, target.id(), base, size, protection, WiringMode::NoLock, bound.clone(), offset);
        if Arc::ptr_eq(&bound, cache.cache()) {
            cache.add_area(area.link());
        } else {
            // 私有层尚未发布
            bound.lock().add_area(area.link());
        }
        let locked = locker.get_mut(target.id()).ok_or(VmError::BadSpace)?;
        self.insert_placed(locked, area, spec);

        if mapping == MappingKind::Shared {
            self.map_resident_pages(target, &cache, base, offset, size, protection, &mut reservation);
        }
        log::debug!(
            "vm: area {} cloned into space {} as area {} at {:#x} ({:?})",
            source,
            target.id(),
            id,
            base,
            mapping
        );
        Ok(id)
    }

    /// 共享克隆时立即映射设备页与常驻页；其余的页留给缺页
    #[allow(clippy::too_many_arguments)]
    fn map_resident_pages(
        &self,
        space: &AddressSpace,
        cache: &LockedCache,
        base: usize,
        offset: usize,
        size: usize,
        protection: AreaProtection,
        reservation: &mut PageReservation,
    ) {
        let device = match cache.cache().kind() {
            CacheKind::Device { base } => Some(*base),
            _ => None,
        };
        let mut map = space.map().lock();
        for index in 0..pages_in(size) {
            let address = base + index * PAGE_SIZE;
            let page_offset = offset + index * PAGE_SIZE;
            let (ppn, tracked) = match device {
                Some(device) => (device + pages_in(page_offset - cache.virtual_base()), false),
                None => match cache.lookup_page(page_offset) {
                    Some(page) if page.wired_count() > 0 => (page.ppn(), true),
                    _ => continue,
                },
            };
            if let Err(err) = map.map(address, ppn, protection, reservation) {
                log::warn!("vm: eager mapping at {:#x} stopped: {}", address, err);
                break;
            }
            if tracked {
                self.mappings.add(ppn, PageMapping::new(space.id(), address));
            }
        }
        map.flush();
    }

    /// 把区域转移到 `target`，返回新的区域编号
    ///
    /// 有被固定内存的区域不能转移。常驻区域在新位置立即重新映射。
    pub fn transfer_area(&self, id: AreaId, target: &Arc<AddressSpace>, spec: AddressSpec) -> VmResult<AreaId> {
        let info = self.get_area_info(id)?;
        let mut reservation = if info.wiring.is_wired() {
            PageReservation::reserve(
                self.allocator.clone(),
                self.platform(),
                target.map().lock().max_pages_need(0, info.size),
                ReserveMode::WaitFor(self.config.commit_timeout),
            )?
        } else {
            PageReservation::empty(self.allocator.clone())
        };
        let (mut locker, mut cache, source_space) = self.lock_area_cache_and_spaces(id, Some(target))?;
        if target.is_deleting() {
            return Err(VmError::BadSpace);
        }
        let (size, wired) = {
            let area = locker
                .get(source_space)
                .and_then(|locked| locked.inner().area(id))
                .ok_or(VmError::BadArea)?;
            if !area.wired_ranges.is_empty() {
                return Err(VmError::Busy);
            }
            (area.size, area.wiring.is_wired())
        };
        let base = locker
            .get(target.id())
            .ok_or(VmError::BadSpace)?
            .inner()
            .find_placement(spec, size)?;
        if wired {
            let exact = target.map().lock().max_pages_need(base, base + size);
            reservation.top_up(self.platform(), exact, ReserveMode::NoWait)?;
        }

        let mut area = {
            let locked = locker.get_mut(source_space).ok_or(VmError::BadArea)?;
            self.area_table.lock().remove(&id);
            if let Some(area) = locked.inner().area(id) {
                self.unmap_range(locked.space(), area, area.base, area.end(), &mut cache);
            }
            locked.inner_mut().remove_area(id).ok_or(VmError::BadArea)?
        };
        cache.remove_area(id);

        let new_id = self.next_area_id();
        area.id = new_id;
        area.space = target.id();
        area.base = base;
        cache.add_area(area.link());

        if wired {
            // 解除映射时去掉了常驻计数，在新位置重新固定
            let mut map = target.map().lock();
            for address in area.page_addresses() {
                let Some(page) = cache.lookup_page_mut(area.cache_offset_of(address)) else {
                    continue;
                };
                page.wire();
                let ppn = page.ppn();
                if let Err(err) = map.map(address, ppn, area.protection, &mut reservation) {
                    log::warn!("vm: remapping wired page at {:#x} failed: {}", address, err);
                    continue;
                }
                self.mappings.add(ppn, PageMapping::new(target.id(), address));
            }
            map.flush();
        }
        let locked = locker.get_mut(target.id()).ok_or(VmError::BadSpace)?;
        self.insert_placed(locked, area, spec);
        log::debug!(
            "vm: area {} transferred from space {} to space {} as area {}",
            id,
            source_space,
            target.id(),
            new_id
        );
        Ok(new_id)
    }

    /// 复制区域到 `target`
    ///
    /// 副本总是按需填充。源缓存上有可写的区域时先做写时复制提升，
    /// 之后双方的写入互不可见。
    pub fn copy_area(
        &self,
        target: &Arc<AddressSpace>,
        name: &str,
        spec: AddressSpec,
        protection: AreaProtection,
        source: AreaId,
    ) -> VmResult<AreaId> {
        let protection = self.check_protection(protection)?;
        let (mut locker, mut cache, source_space) = self.lock_area_cache_and_spaces(source, Some(target))?;
        if target.is_deleting() {
            return Err(VmError::BadSpace);
        }
        if matches!(cache.cache().kind(), CacheKind::Device { .. } | CacheKind::Null) {
            return Err(VmError::InvalidArgs);
        }
        let (size, offset) = {
            let area = locker
                .get(source_space)
                .and_then(|locked| locked.inner().area(source))
                .ok_or(VmError::BadArea)?;
            (area.size, area.cache_offset)
        };
        let base = locker
            .get(target.id())
            .ok_or(VmError::BadSpace)?
            .inner()
            .find_placement(spec, size)?;

        if Self::needs_promotion(&locker, &cache) {
            self.promote_to_copy_on_write(&mut locker, &mut cache)?;
        }

        let copy = self.attach(&mut cache, offset, size, MappingKind::Private, Self::priority_for(target))?;
        let id = self.next_area_id();
        let area = Area::new(id, name, target.id(), base, size, protection, WiringMode::NoLock, copy.clone(), offset);
        // 私有层尚未发布
        copy.lock().add_area(area.link());
        let locked = locker.get_mut(target.id()).ok_or(VmError::BadSpace)?;
        self.insert_placed(locked, area, spec);
        log::debug!(
            "vm: area {} copied into space {} as area {} at {:#x}",
            source,
            target.id(),
            id,
            base
        );
        Ok(id)
    }

    // ========================================================================
    // 保护位
    // ========================================================================

    /// 修改整个区域的保护位，清除逐页覆盖
    pub fn set_area_protection(&self, id: AreaId, protection: AreaProtection) -> VmResult<()> {
        self.change_protection(id, None, protection)
    }

    /// 修改 `[address, address + size)` 的逐页保护位，范围可以跨越多个区域
    ///
    /// 范围内不能有未映射的空洞。
    pub fn set_memory_protection(
        &self,
        space: &Arc<AddressSpace>,
        address: usize,
        size: usize,
        protection: AreaProtection,
    ) -> VmResult<()> {
        if !is_page_aligned(address) || size == 0 {
            return Err(VmError::InvalidArgs);
        }
        let size = page_align_up(size).ok_or(VmError::InvalidArgs)?;
        let end = address.checked_add(size).ok_or(VmError::InvalidArgs)?;
        let pieces: Vec<(AreaId, usize, usize)> = {
            let locked = space.read_lock();
            let mut pieces = Vec::new();
            let mut cursor = address;
            while cursor < end {
                let area = locked.inner().lookup(cursor).ok_or(VmError::BadAddress)?;
                let piece_end = area.end().min(end);
                pieces.push((area.id, cursor, piece_end));
                cursor = piece_end;
            }
            pieces
        };
        for (id, start, end) in pieces {
            self.change_protection(id, Some((start, end)), protection)?;
        }
        Ok(())
    }

    fn change_protection(
        &self,
        id: AreaId,
        range: Option<(usize, usize)>,
        protection: AreaProtection,
    ) -> VmResult<()> {
        let protection = self.check_protection(protection)?;
        let (mut locker, mut cache, space_id) = self.lock_area_cache_and_spaces(id, None)?;

        let promoted = if protection.is_writable()
            && cache.has_consumers()
            && matches!(cache.cache().kind(), CacheKind::Anonymous { .. })
        {
            Some(self.promote_to_copy_on_write(&mut locker, &mut cache)?)
        } else {
            None
        };
        // 需要区域自己的顶层缓存来判断哪些页可以可写映射
        let top = match promoted {
            Some(upper) => {
                drop(cache);
                upper.lock()
            }
            None => cache,
        };

        let locked = locker.get_mut(space_id).ok_or(VmError::BadArea)?;
        let (start, end) = {
            let area = locked.inner_mut().area_mut(id).ok_or(VmError::BadArea)?;
            match range {
                Some((start, end)) => {
                    area.set_page_protection(start, end, protection);
                    (start, end)
                }
                None => {
                    area.set_protection(protection);
                    (area.base, area.end())
                }
            }
        };

        let area = locked.inner().area(id).ok_or(VmError::BadArea)?;
        let file_backed = matches!(top.cache().kind(), CacheKind::FileBacked { .. });
        let device = matches!(top.cache().kind(), CacheKind::Device { .. });
        let mut map = locked.space().map().lock();
        for address in (start..end).step_by(PAGE_SIZE) {
            let Some(info) = map.query(address) else {
                continue;
            };
            let mut page_protection = area.page_protection(address);
            let owned = top
                .lookup_page(area.cache_offset_of(address))
                .filter(|page| page.ppn() == info.ppn);
            let writable_mapping = match owned {
                // 共享文件页在被写脏之前保持只读
                Some(page) => !file_backed || page.state() == PageState::Modified,
                None => device,
            };
            if !writable_mapping {
                page_protection = page_protection.without_write();
            }
            map.protect(address, address + PAGE_SIZE, page_protection);
        }
        map.flush();
        log::debug!("vm: area {} [{:#x}, {:#x}) protection {:?}", id, start, end, protection);
        Ok(())
    }

    // ========================================================================
    // 保留范围
    // ========================================================================

    /// 保留一段地址范围，之后只有精确放置的区域可以落在其中
    pub fn reserve_address_range(
        &self,
        space: &Arc<AddressSpace>,
        spec: AddressSpec,
        size: usize,
    ) -> VmResult<usize> {
        if size == 0 || !is_page_aligned(size) {
            return Err(VmError::InvalidArgs);
        }
        let mut locked = space.write_lock();
        let base = locked.inner().find_placement(spec, size)?;
        if !locked.inner().is_range_free(base, base + size, None, true) {
            return Err(VmError::AddressInUse);
        }
        locked.inner_mut().add_reserved(base, size);
        log::debug!("vm: reserved [{:#x}, {:#x}) in space {}", base, base + size, space.id());
        Ok(base)
    }

    /// 取消完全落在 `[base, base + size)` 内的保留范围
    pub fn unreserve_address_range(&self, space: &Arc<AddressSpace>, base: usize, size: usize) -> VmResult<()> {
        let end = base.checked_add(size).ok_or(VmError::InvalidArgs)?;
        let removed = space.write_lock().inner_mut().remove_reserved(base, end);
        log::debug!(
            "vm: {} reserved ranges released in [{:#x}, {:#x}) of space {}",
            removed,
            base,
            end,
            space.id()
        );
        Ok(())
    }

    // ========================================================================
    // 查询
    // ========================================================================

    /// 区域信息
    pub fn get_area_info(&self, id: AreaId) -> VmResult<AreaInfo> {
        let space = self.area_space(id)?;
        let locked = space.read_lock();
        let area = locked.inner().area(id).ok_or(VmError::BadArea)?;
        let cache = area.cache.lock();
        let resident = cache
            .pages_in(area.cache_offset, area.cache_offset + area.size)
            .count();
        let mut copy_depth = 0;
        let mut next = cache.source().cloned();
        while let Some(source) = next {
            copy_depth += 1;
            next = source.source();
        }
        Ok(AreaInfo {
            id,
            name: area.name.clone(),
            space: area.space,
            base: area.base,
            size: area.size,
            protection: area.protection,
            wiring: area.wiring,
            cache: cache.cache().id(),
            cache_kind: cache.cache().tag(),
            ram_size: resident * PAGE_SIZE,
            copy_depth,
            wired_ranges: area.wired_ranges.len(),
        })
    }

    /// 覆盖地址的区域
    pub fn area_for(&self, space: &Arc<AddressSpace>, address: usize) -> Option<AreaId> {
        space.read_lock().inner().lookup(address).map(|area| area.id)
    }

    /// 区域当前绑定的缓存
    pub fn area_cache(&self, id: AreaId) -> VmResult<Arc<Cache>> {
        let space = self.area_space(id)?;
        let locked = space.read_lock();
        let area = locked.inner().area(id).ok_or(VmError::BadArea)?;
        Ok(area.cache.clone())
    }

    /// 为后备存储创建文件缓存，覆盖整个偏移空间
    ///
    /// 每个存储只应创建一次；之后用 [`AreaBacking::Cache`] 私有或共享地映射它。
    pub fn file_cache(&self, store: Arc<dyn BackingStore>) -> Arc<Cache> {
        let cache = self.new_cache(
            CacheKind::FileBacked { store },
            0..page_align_down(usize::MAX),
            0,
            MemoryPriority::User,
        );
        log::debug!("vm: file cache {} created", cache.id());
        cache
    }
}
