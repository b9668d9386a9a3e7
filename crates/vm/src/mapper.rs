//! 后备存储映射
//!
//! 把区域接到缓存上：私有映射在源缓存之上叠加一个新的匿名缓存，
//! 共享映射直接绑定源缓存。以及写时复制的提升：在一个缓存之上
//! 插入新的匿名缓存，并把原来绑定在它上面的区域全部迁移上去。

use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::accountant::MemoryPriority;
use crate::address::{PAGE_SIZE, Ppn};
use crate::cache::{AreaLink, Cache, CacheKind, LockedCache};
use crate::error::{VmError, VmResult};
use crate::page::{PageReservation, PageState, ReserveMode, VmPage};
use crate::space::{MultiSpaceLocker, SpaceLock};
use crate::virtual_memory::VirtualMemory;

/// 映射方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    /// 写时复制，修改对源不可见
    Private,
    /// 直接共享源缓存
    Shared,
}

impl VirtualMemory {
    /// 为覆盖源缓存 `[offset, offset + size)` 的新区域选择缓存
    ///
    /// 私有映射返回新建的匿名缓存（按页提交），其父缓存为 `source`；
    /// 共享映射返回 `source` 本身。设备与占位缓存不能私有映射。
    /// `source` 上仍有可写区域时，调用者须先对它做写时复制提升。
    pub(crate) fn attach(
        &self,
        source: &mut LockedCache,
        offset: usize,
        size: usize,
        kind: MappingKind,
        priority: MemoryPriority,
    ) -> VmResult<Arc<Cache>> {
        if kind == MappingKind::Shared {
            return Ok(source.cache().clone());
        }
        if matches!(source.cache().kind(), CacheKind::Device { .. } | CacheKind::Null) {
            return Err(VmError::InvalidArgs);
        }
        let end = offset.checked_add(size).ok_or(VmError::InvalidArgs)?;
        let upper = self.new_cache(CacheKind::Anonymous { overcommit: true }, offset..end, 0, priority);
        // 新缓存尚未发布，在持有下层锁时给它加锁不会与其它路径交叉
        let previous = upper.lock().set_source(Some(source.cache().clone()));
        debug_assert!(previous.is_none());
        source.add_consumer(&upper);
        log::debug!(
            "vm: private cache {} over cache {} [{:#x}, {:#x})",
            upper.id(),
            source.cache().id(),
            offset,
            end
        );
        Ok(upper)
    }

    /// 写时复制提升
    ///
    /// 在 `lower` 之上插入新的匿名缓存，把绑定在 `lower` 上的全部区域
    /// 迁移上去，再把这些区域的映射改为只读，下一次写入会缺页并复制。
    /// 常驻页不能改为只读：它们被移到新缓存（映射保持不变），`lower`
    /// 中留下内容相同的副本。
    ///
    /// 调用者必须写锁住 `lower` 全部区域所在的地址空间，并锁住 `lower`。
    pub(crate) fn promote_to_copy_on_write(
        &self,
        locker: &mut MultiSpaceLocker,
        lower: &mut LockedCache,
    ) -> VmResult<Arc<Cache>> {
        let priority = lower.cache().priority();
        let (base, end) = (lower.virtual_base(), lower.virtual_end());
        let wired: Vec<(usize, Ppn)> = lower
            .pages_in(base, end)
            .filter(|(_, page)| page.wired_count() > 0)
            .map(|(offset, page)| (*offset, page.ppn()))
            .collect();

        let mut copies = PageReservation::reserve(
            self.allocator().clone(),
            self.platform(),
            wired.len(),
            ReserveMode::NoWait,
        )?;
        let commitment = wired.len() * PAGE_SIZE;
        self.accountant()
            .try_reserve_non_blocking(commitment, priority)
            .map_err(|_| VmError::NoMemory)?;

        let upper = self.new_cache(
            CacheKind::Anonymous { overcommit: true },
            base..end,
            commitment,
            priority,
        );
        let links: Vec<AreaLink> = lower.areas().to_vec();
        let moved_offsets: Vec<usize> = wired.iter().map(|(offset, _)| *offset).collect();
        {
            // 新缓存尚未发布，见 attach
            let mut locked_upper = upper.lock();
            locked_upper.set_source(Some(lower.cache().clone()));
            for (offset, ppn) in &wired {
                let (Some(page), Some(copy)) = (lower.remove_page(*offset), copies.take()) else {
                    continue;
                };
                self.allocator().copy_page(*ppn, copy);
                lower.insert_page(*offset, VmPage::new(copy, PageState::Active));
                locked_upper.insert_page(*offset, page);
            }
            for link in &links {
                locked_upper.add_area(link.clone());
            }
        }
        for link in &links {
            lower.remove_area(link.area);
        }
        lower.add_consumer(&upper);

        for link in &links {
            let Some(locked) = locker.get_mut(link.space) else {
                continue;
            };
            if let Some(area) = locked.inner_mut().area_mut(link.area) {
                // 旧句柄只是引用计数减一：upper 的 source 和调用者仍持有 lower
                area.cache = upper.clone();
                area.retarget_wired_pages(lower.cache(), &upper, &moved_offsets);
            }
        }

        let moved: BTreeSet<Ppn> = wired.iter().map(|(_, ppn)| *ppn).collect();
        for link in &links {
            let Some(locked) = locker.get(link.space) else {
                continue;
            };
            let Some(area) = locked.inner().area(link.area) else {
                continue;
            };
            let mut map = locked.space().map().lock();
            for address in area.page_addresses() {
                let Some(info) = map.query(address) else {
                    continue;
                };
                if moved.contains(&info.ppn) {
                    continue;
                }
                map.protect(address, address + PAGE_SIZE, info.protection.without_write());
            }
            map.flush();
        }

        // 其它区域若映射了被移走的常驻页，此后应看到 lower 中的副本
        for (offset, ppn) in &wired {
            for mapping in self.mapping_table().mappings_of(*ppn) {
                let migrated = links.iter().any(|link| {
                    link.space == mapping.space && link.address_of(*offset) == Some(mapping.address)
                });
                if !migrated {
                    self.unmap_stale_mapping(mapping, *ppn);
                }
            }
        }

        log::debug!(
            "vm: cache {} promoted, {} areas moved to cache {} ({} wired pages)",
            lower.cache().id(),
            links.len(),
            upper.id(),
            wired.len()
        );
        Ok(upper)
    }
}
