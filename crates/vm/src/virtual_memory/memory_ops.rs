//! 内存范围操作
//!
//! 物理映射查询、固定与解除固定、内核代为读写用户内存，以及共享文件
//! 映射的回写。

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use uapi::area::AreaProtection;

use crate::address::{PAGE_SIZE, Ppn, page_align_down, page_align_up, pages_between};
use crate::area::{AreaId, WiredPage, WiredRange};
use crate::cache::CacheKind;
use crate::error::{VmError, VmResult};
use crate::fault::FaultRequest;
use crate::page::PageState;
use crate::space::{AddressSpace, SpaceLock};
use crate::translation_map::PageFlags;

use super::VirtualMemory;

/// 访问一页时最多重新缺页的次数
const ACCESS_ATTEMPTS: usize = 4;

/// 一段物理连续的映射
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalRun {
    /// 物理地址
    pub address: usize,
    /// 字节数
    pub size: usize,
}

fn page_range(address: usize, size: usize) -> VmResult<(usize, usize)> {
    let end = address.checked_add(size).ok_or(VmError::InvalidArgs)?;
    let end = page_align_up(end).ok_or(VmError::InvalidArgs)?;
    Ok((page_align_down(address), end))
}

fn access_allowed(protection: AreaProtection, is_write: bool, is_user: bool) -> bool {
    match (is_user, is_write) {
        (true, true) => protection.contains(AreaProtection::WRITE),
        (true, false) => protection.contains(AreaProtection::READ),
        (false, true) => protection.contains(AreaProtection::KERNEL_WRITE),
        (false, false) => protection.contains(AreaProtection::KERNEL_READ),
    }
}

impl VirtualMemory {
    /// 枚举 `[address, address + size)` 的物理映射，合并物理连续的页
    ///
    /// 遇到第一个未映射的页即停止。
    pub fn get_memory_map(
        &self,
        space: &Arc<AddressSpace>,
        address: usize,
        size: usize,
    ) -> VmResult<Vec<PhysicalRun>> {
        let (start, end) = page_range(address, size)?;
        let locked = space.read_lock();
        if locked.inner().lookup(start).is_none() {
            return Err(VmError::BadAddress);
        }
        let map = space.map().lock();
        let mut runs: Vec<PhysicalRun> = Vec::new();
        for page in pages_between(start, end) {
            let Some(info) = map.query(page) else {
                break;
            };
            let physical = info.ppn.start_addr();
            match runs.last_mut() {
                Some(run) if run.address + run.size == physical => run.size += PAGE_SIZE,
                _ => runs.push(PhysicalRun {
                    address: physical,
                    size: PAGE_SIZE,
                }),
            }
        }
        Ok(runs)
    }

    /// 固定 `[address, address + size)`：缺页调入并增加常驻计数
    ///
    /// `writable` 为真时按写访问调入，私有映射会先完成复制。固定记录在
    /// 各区域上，区域删除时自动解除。
    pub fn lock_memory(
        &self,
        space: &Arc<AddressSpace>,
        address: usize,
        size: usize,
        writable: bool,
    ) -> VmResult<()> {
        let (start, end) = page_range(address, size)?;
        let mut wired: Vec<(usize, WiredPage)> = Vec::new();
        for page in pages_between(start, end) {
            let request = FaultRequest {
                address: page,
                is_write: writable,
                is_execute: false,
                is_user: !space.is_kernel(),
                wire: true,
            };
            match self.soft_fault(space, request) {
                Ok(faulted) => {
                    if let Some(page_ref) = faulted.wired {
                        wired.push((page, page_ref));
                    }
                }
                Err(err) => {
                    self.unwire_pages(wired.into_iter().map(|(_, page)| page));
                    return Err(err);
                }
            }
        }

        let mut orphaned = Vec::new();
        {
            let mut locked = space.write_lock();
            let mut ranges: Vec<(AreaId, WiredRange)> = Vec::new();
            for (page, page_ref) in wired {
                let Some(area) = locked.inner().lookup(page) else {
                    orphaned.push(page_ref);
                    continue;
                };
                match ranges.last_mut() {
                    Some((id, range)) if *id == area.id && range.end() == page => {
                        range.size += PAGE_SIZE;
                        range.pages.push(page_ref);
                    }
                    _ => ranges.push((
                        area.id,
                        WiredRange {
                            base: page,
                            size: PAGE_SIZE,
                            pages: vec![page_ref],
                        },
                    )),
                }
            }
            for (id, range) in ranges {
                match locked.inner_mut().area_mut(id) {
                    Some(area) => area.wired_ranges.push(range),
                    None => orphaned.extend(range.pages),
                }
            }
        }
        if !orphaned.is_empty() {
            // 区域在调入之后被删除
            self.unwire_pages(orphaned.into_iter());
            return Err(VmError::BadAddress);
        }
        log::debug!("vm: locked [{:#x}, {:#x}) in space {}", start, end, space.id());
        Ok(())
    }

    /// 解除与 `[address, address + size)` 相交的固定范围
    pub fn unlock_memory(&self, space: &Arc<AddressSpace>, address: usize, size: usize) -> VmResult<()> {
        let (start, end) = page_range(address, size)?;
        let released: Vec<WiredRange> = {
            let mut locked = space.write_lock();
            let mut released = Vec::new();
            for id in locked.inner().overlapping(start, end) {
                if let Some(area) = locked.inner_mut().area_mut(id) {
                    released.extend(area.take_wired_ranges_in(start, end));
                }
            }
            released
        };
        if released.is_empty() {
            return Err(VmError::InvalidArgs);
        }
        self.unwire_pages(released.into_iter().flat_map(|range| range.pages));
        log::debug!("vm: unlocked [{:#x}, {:#x}) in space {}", start, end, space.id());
        Ok(())
    }

    fn unwire_pages(&self, pages: impl Iterator<Item = WiredPage>) {
        for page in pages {
            let mut cache = page.cache.lock();
            if let Some(vm_page) = cache.lookup_page_mut(page.offset) {
                vm_page.unwire();
            }
        }
    }

    // ========================================================================
    // 内核代为访问
    // ========================================================================

    /// 从地址空间读取字节，按需缺页
    pub fn read_bytes_at(
        &self,
        space: &Arc<AddressSpace>,
        address: usize,
        buf: &mut [u8],
        is_user: bool,
    ) -> VmResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let current = address.checked_add(done).ok_or(VmError::BadAddress)?;
            let in_page = current - page_align_down(current);
            let chunk = (PAGE_SIZE - in_page).min(buf.len() - done);
            let target = &mut buf[done..done + chunk];
            self.access_page(space, current, false, is_user, |ppn| {
                self.allocator.read_page(ppn, in_page, target);
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// 向地址空间写入字节，按需缺页
    pub fn write_bytes_at(
        &self,
        space: &Arc<AddressSpace>,
        address: usize,
        data: &[u8],
        is_user: bool,
    ) -> VmResult<()> {
        let mut done = 0;
        while done < data.len() {
            let current = address.checked_add(done).ok_or(VmError::BadAddress)?;
            let in_page = current - page_align_down(current);
            let chunk = (PAGE_SIZE - in_page).min(data.len() - done);
            let source = &data[done..done + chunk];
            self.access_page(space, current, true, is_user, |ppn| {
                self.allocator.write_page(ppn, in_page, source);
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// 像 CPU 一样访问一页：映射存在且权限足够时直接访问，否则缺页后重试
    ///
    /// 访问期间持有地址空间读锁，页不会被释放。
    fn access_page(
        &self,
        space: &Arc<AddressSpace>,
        address: usize,
        is_write: bool,
        is_user: bool,
        access: impl FnOnce(Ppn),
    ) -> VmResult<()> {
        let page = page_align_down(address);
        let mut access = Some(access);
        for _ in 0..ACCESS_ATTEMPTS {
            {
                let _locked = space.read_lock();
                let info = space.map().lock().query(page);
                if let Some(info) = info.filter(|info| access_allowed(info.protection, is_write, is_user)) {
                    if let Some(access) = access.take() {
                        access(info.ppn);
                    }
                    return Ok(());
                }
            }
            let request = FaultRequest {
                address: page,
                is_write,
                is_execute: false,
                is_user,
                wire: false,
            };
            self.soft_fault(space, request)?;
        }
        log::warn!("vm: access to {:#x} in space {} keeps faulting", address, space.id());
        Err(VmError::BadAddress)
    }

    // ========================================================================
    // 回写
    // ========================================================================

    /// 把共享文件映射中被修改的页写回后备存储，返回写回的页数
    ///
    /// 写回期间页被标记为忙，映射先改为只读，期间的写入会等待并在之后
    /// 重新把页标记为已修改。匿名区域没有需要写回的内容。
    pub fn sync_area(&self, id: AreaId) -> VmResult<usize> {
        let space = self.area_space(id)?;
        let (cache, start, end) = {
            let locked = space.read_lock();
            let area = locked.inner().area(id).ok_or(VmError::BadArea)?;
            (area.cache.clone(), area.cache_offset, area.cache_offset + area.size)
        };
        let store = match cache.kind() {
            CacheKind::FileBacked { store } => store.clone(),
            _ => return Ok(0),
        };

        let dirty: Vec<(usize, Ppn)> = {
            let mut locked = cache.lock();
            let dirty: Vec<(usize, Ppn)> = locked
                .pages_in(start, end)
                .filter(|(_, page)| page.state() == PageState::Modified && !page.is_busy())
                .map(|(offset, page)| (*offset, page.ppn()))
                .collect();
            for (offset, ppn) in &dirty {
                if let Some(page) = locked.lookup_page_mut(*offset) {
                    page.set_busy(true);
                    page.set_state(PageState::Active);
                }
                self.write_protect_mappings(*ppn);
            }
            dirty
        };

        let mut buffer = vec![0u8; PAGE_SIZE];
        let mut written = 0;
        let mut first_error = None;
        let mut failed = Vec::new();
        for (offset, ppn) in &dirty {
            self.allocator.read_page(*ppn, 0, &mut buffer);
            let len = store.size().saturating_sub(*offset).min(PAGE_SIZE);
            match store.write_at(*offset, &buffer[..len]) {
                Ok(_) => written += 1,
                Err(code) => {
                    log::warn!(
                        "vm: writing back offset {:#x} of cache {} failed: {}",
                        offset,
                        cache.id(),
                        code
                    );
                    first_error.get_or_insert(VmError::Io(code));
                    failed.push(*offset);
                }
            }
        }

        {
            let mut locked = cache.lock();
            for (offset, ppn) in &dirty {
                let Some(page) = locked.lookup_page_mut(*offset) else {
                    continue;
                };
                if page.ppn() != *ppn {
                    continue;
                }
                page.set_busy(false);
                if failed.contains(offset) {
                    page.set_state(PageState::Modified);
                }
            }
        }
        log::debug!("vm: area {}: {} of {} dirty pages written back", id, written, dirty.len());
        match first_error {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }

    /// 把 `ppn` 的全部映射改为只读并清除修改标志
    fn write_protect_mappings(&self, ppn: Ppn) {
        for mapping in self.mappings.mappings_of(ppn) {
            let Some(space) = self.space_by_id(mapping.space) else {
                continue;
            };
            let mut map = space.map().lock();
            let Some(info) = map.query(mapping.address).filter(|info| info.ppn == ppn) else {
                continue;
            };
            map.protect(mapping.address, mapping.address + PAGE_SIZE, info.protection.without_write());
            map.clear_flags(mapping.address, PageFlags::MODIFIED);
            map.flush();
        }
    }
}
