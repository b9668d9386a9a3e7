//! 软缺页解析
//!
//! 每次缺页（以及显式的常驻请求）都走这里：
//!
//! 1. 持锁之前预留最坏情况所需的页（新页 + 页表页）
//! 2. 读锁地址空间，找到覆盖地址的区域并检查权限
//! 3. 自顶向下锁住缓存链；缓存种类可以自行处理（设备、存储直映射）
//! 4. 定位页：忙则等待、后备存储可提供则读入、在祖先缓存中且为写则复制、
//!    都没有则分配清零页
//! 5. 安装映射：页不在区域自己的缓存中时只读映射
//!
//! 任何需要放开全部锁的步骤（等待忙页、I/O、阻塞申请提交）都以
//! [`Resolution::Retry`] 返回，外层循环处理后从第 2 步重新开始，
//! 不假设放锁期间世界没有变化。

use alloc::sync::Arc;
use alloc::vec;
use core::sync::atomic::{AtomicU64, Ordering};

use uapi::area::AreaProtection;

use crate::accountant::MemoryPriority;
use crate::address::{PAGE_SIZE, Ppn, page_align_down, pages_in};
use crate::area::{Area, WiredPage};
use crate::cache::{BackingStore, Cache, CacheChain, CacheKind, LockedCache, StoreFault};
use crate::error::{VmError, VmResult};
use crate::mapping_table::PageMapping;
use crate::page::{PageReservation, PageState, ReserveMode, VmPage};
use crate::platform::FaultSignal;
use crate::space::{AddressSpace, SpaceLock, SpaceReadLocked};
use crate::virtual_memory::VirtualMemory;

// ============================================================================
// 统计
// ============================================================================

/// 缺页统计
pub struct FaultStats {
    total: AtomicU64,
    copy_on_write: AtomicU64,
    zero_fill: AtomicU64,
    page_in: AtomicU64,
    restarts: AtomicU64,
    busy_waits: AtomicU64,
    failures: AtomicU64,
}

/// 缺页统计快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaultStatsSnapshot {
    /// 软缺页总数
    pub total: u64,
    /// 写时复制次数
    pub copy_on_write: u64,
    /// 分配清零页次数
    pub zero_fill: u64,
    /// 从后备存储读入次数
    pub page_in: u64,
    /// 放锁后重新开始的次数
    pub restarts: u64,
    /// 等待忙页次数
    pub busy_waits: u64,
    /// 失败次数
    pub failures: u64,
}

impl FaultStats {
    pub(crate) fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            copy_on_write: AtomicU64::new(0),
            zero_fill: AtomicU64::new(0),
            page_in: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            busy_waits: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// 快照
    pub fn snapshot(&self) -> FaultStatsSnapshot {
        FaultStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            copy_on_write: self.copy_on_write.load(Ordering::Relaxed),
            zero_fill: self.zero_fill.load(Ordering::Relaxed),
            page_in: self.page_in.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            busy_waits: self.busy_waits.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// 解析状态
// ============================================================================

/// 缺页入口的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// 映射已安装，重新执行指令即可
    Resolved,
    /// 已向用户线程投递信号
    Signal {
        /// 信号
        signal: FaultSignal,
        /// 出错地址
        address: usize,
    },
    /// 内核上下文，跳转到登记的修复地址
    KernelHandler(usize),
}

/// 一次缺页请求
#[derive(Debug, Clone, Copy)]
pub(crate) struct FaultRequest {
    pub(crate) address: usize,
    pub(crate) is_write: bool,
    pub(crate) is_execute: bool,
    pub(crate) is_user: bool,
    /// 解析后给页加常驻计数（lock_memory）
    pub(crate) wire: bool,
}

/// 解析得到的页
pub(crate) struct FaultedPage {
    pub(crate) ppn: Ppn,
    pub(crate) wired: Option<WiredPage>,
}

/// 需要放开全部锁才能继续的原因
enum RetryReason {
    /// 页忙，等它变为空闲
    WaitBusy { cache: Arc<Cache>, offset: usize },
    /// 已插入忙页，需要从后备存储读入
    ReadIn {
        cache: Arc<Cache>,
        store: Arc<dyn BackingStore>,
        offset: usize,
        ppn: Ppn,
    },
    /// 非阻塞提交失败，需要阻塞申请一页的提交
    NeedMemory { priority: MemoryPriority },
}

/// 单轮解析的结果
enum Resolution {
    Resolved(FaultedPage),
    Retry(RetryReason),
    Error(VmError),
}

/// 沿缓存链定位的结果
enum Located {
    Page { level: usize, ppn: Ppn, busy: bool },
    Store { level: usize, store: Arc<dyn BackingStore> },
    Nothing,
}

fn check_protection(area: &Area, request: &FaultRequest) -> VmResult<()> {
    let protection = area.page_protection(request.address);
    if request.is_user && !protection.is_user_accessible() {
        return Err(VmError::PermissionDenied);
    }
    let (read, write, execute) = if request.is_user {
        (AreaProtection::READ, AreaProtection::WRITE, AreaProtection::EXECUTE)
    } else {
        (
            AreaProtection::KERNEL_READ,
            AreaProtection::KERNEL_WRITE,
            AreaProtection::KERNEL_EXECUTE,
        )
    };
    let allowed = if request.is_write {
        protection.contains(write)
    } else if request.is_execute {
        protection.contains(execute)
    } else {
        protection.contains(read)
    };
    if allowed {
        Ok(())
    } else {
        Err(VmError::PermissionDenied)
    }
}

impl VirtualMemory {
    /// 缺页入口，由架构相关的陷入处理调用
    ///
    /// `current` 是当前线程所属 team 的地址空间；内核地址不需要。
    /// 失败时用户态收到信号，内核态跳到登记的修复地址，没有修复地址
    /// 则 panic。
    pub fn page_fault(
        &self,
        current: Option<&Arc<AddressSpace>>,
        address: usize,
        pc: usize,
        is_write: bool,
        is_execute: bool,
        is_user: bool,
    ) -> FaultOutcome {
        let request = FaultRequest {
            address,
            is_write,
            is_execute,
            is_user,
            wire: false,
        };
        let kernel = self.kernel_address_space();
        let result = if kernel.contains(address) {
            if is_user {
                Err(VmError::PermissionDenied)
            } else {
                self.soft_fault(&kernel, request)
            }
        } else {
            match current {
                Some(space) => self.soft_fault(space, request),
                None => Err(VmError::BadAddress),
            }
        };

        let err = match result {
            Ok(_) => return FaultOutcome::Resolved,
            Err(err) => err,
        };
        FaultStats::bump(&self.stats().failures);
        if is_user {
            let signal = match err {
                VmError::Io(_) => FaultSignal::BusError,
                _ => FaultSignal::SegmentationFault,
            };
            log::debug!(
                "vm: user fault at {:#x} (ip {:#x}, write {}): {}",
                address,
                pc,
                is_write,
                err
            );
            self.platform().send_signal(signal, address, pc);
            return FaultOutcome::Signal { signal, address };
        }
        match self.platform().kernel_fault_handler() {
            Some(handler) => FaultOutcome::KernelHandler(handler),
            None => {
                log::error!("vm: kernel fault at {:#x} (ip {:#x}): {}", address, pc, err);
                panic!(
                    "vm: unhandled kernel page fault at {:#x}, ip {:#x}: {}",
                    address, pc, err
                );
            }
        }
    }

    /// 解析一次软缺页
    pub(crate) fn soft_fault(
        &self,
        space: &Arc<AddressSpace>,
        request: FaultRequest,
    ) -> VmResult<FaultedPage> {
        FaultStats::bump(&self.stats().total);
        space.count_fault();
        let address = page_align_down(request.address);
        let needed = 1 + space.map().lock().max_pages_need(address, address + PAGE_SIZE);
        let mut reservation =
            PageReservation::reserve(self.allocator().clone(), self.platform(), needed, ReserveMode::Wait)?;
        let mut precommitted = 0;

        let result = loop {
            if let Err(err) = reservation.top_up(self.platform(), needed, ReserveMode::Wait) {
                break Err(err);
            }
            let step = {
                let locked = space.read_lock();
                self.resolve(&locked, &request, &mut reservation, &mut precommitted)
            };
            let reason = match step {
                Resolution::Resolved(page) => break Ok(page),
                Resolution::Error(err) => break Err(err),
                Resolution::Retry(reason) => reason,
            };
            FaultStats::bump(&self.stats().restarts);
            match reason {
                RetryReason::WaitBusy { cache, offset } => {
                    log::trace!("vm: fault at {:#x} waits for busy page", address);
                    cache.wait_for_unbusy(offset, self.platform());
                }
                RetryReason::ReadIn {
                    cache,
                    store,
                    offset,
                    ppn,
                } => {
                    if let Err(err) = self.read_in(&cache, &*store, offset, ppn) {
                        break Err(err);
                    }
                }
                RetryReason::NeedMemory { priority } => {
                    match self
                        .accountant()
                        .reserve(PAGE_SIZE, priority, self.config().fault_memory_timeout)
                    {
                        Ok(()) => precommitted += PAGE_SIZE,
                        Err(err) => break Err(err),
                    }
                }
            }
        };
        self.accountant().unreserve(precommitted);
        result
    }

    /// 持有地址空间读锁时的一轮解析
    fn resolve(
        &self,
        locked: &SpaceReadLocked,
        request: &FaultRequest,
        reservation: &mut PageReservation,
        precommitted: &mut usize,
    ) -> Resolution {
        let space = locked.space();
        if space.is_deleting() {
            return Resolution::Error(VmError::BadSpace);
        }
        let address = page_align_down(request.address);
        let Some(area) = locked.inner().lookup(address) else {
            return Resolution::Error(VmError::BadAddress);
        };
        if let Err(err) = check_protection(area, request) {
            return Resolution::Error(err);
        }
        let offset = area.cache_offset_of(address);
        let mut chain = CacheChain::lock_top(locked, area.cache().clone());

        let direct = match chain.top().cache().kind() {
            CacheKind::Null => return Resolution::Error(VmError::BadAddress),
            CacheKind::Device { base } => Some(*base + pages_in(offset - chain.top().virtual_base())),
            CacheKind::FileBacked { store } => match store.fault(offset) {
                StoreFault::MapPhysical(ppn) => Some(ppn),
                StoreFault::NotHandled => None,
            },
            CacheKind::Anonymous { .. } => None,
        };
        if let Some(ppn) = direct {
            drop(chain);
            return match self.install_mapping(space, area, address, ppn, true, false, reservation) {
                Ok(()) => Resolution::Resolved(FaultedPage { ppn, wired: None }),
                Err(err) => Resolution::Error(err),
            };
        }

        // Locate
        let mut level = 0;
        let located = loop {
            let cache = chain.get(level);
            if cache.covers(offset) {
                if let Some(page) = cache.lookup_page(offset) {
                    break Located::Page {
                        level,
                        ppn: page.ppn(),
                        busy: page.is_busy(),
                    };
                }
                if let CacheKind::FileBacked { store } = cache.cache().kind() {
                    if store.has_page(offset) {
                        break Located::Store {
                            level,
                            store: store.clone(),
                        };
                    }
                }
            }
            if !chain.lock_parent() {
                break Located::Nothing;
            }
            level += 1;
        };

        let (level, ppn) = match located {
            Located::Page {
                level, busy: true, ..
            } => {
                FaultStats::bump(&self.stats().busy_waits);
                return Resolution::Retry(RetryReason::WaitBusy {
                    cache: chain.get(level).cache().clone(),
                    offset,
                });
            }
            Located::Page { level, ppn, .. } if level == 0 || !request.is_write => (level, ppn),
            Located::Page { ppn: source, .. } => {
                // CopyOnWrite
                if !chain.top_mut().ensure_page_commitment(precommitted) {
                    return Resolution::Retry(RetryReason::NeedMemory {
                        priority: chain.top().cache().priority(),
                    });
                }
                let Some(copy) = reservation.take() else {
                    return Resolution::Error(VmError::NoMemory);
                };
                self.allocator().copy_page(source, copy);
                chain
                    .top_mut()
                    .insert_page(offset, VmPage::new(copy, PageState::Active));
                FaultStats::bump(&self.stats().copy_on_write);
                self.unmap_stale_copies(chain.top(), offset, source, PageMapping::new(space.id(), address));
                log::trace!("vm: copy-on-write at {:#x}: {} -> {}", address, source, copy);
                (0, copy)
            }
            Located::Store { level, store } => {
                // ReadIn
                let Some(ppn) = reservation.take() else {
                    return Resolution::Error(VmError::NoMemory);
                };
                chain.get_mut(level).insert_page(offset, VmPage::new_busy(ppn));
                FaultStats::bump(&self.stats().page_in);
                return Resolution::Retry(RetryReason::ReadIn {
                    cache: chain.get(level).cache().clone(),
                    store,
                    offset,
                    ppn,
                });
            }
            Located::Nothing => {
                // AllocateClean：写入放进顶层，只读访问放进最深的覆盖该偏移的缓存
                let level = if request.is_write {
                    0
                } else {
                    (0..chain.len())
                        .rev()
                        .find(|level| chain.get(*level).covers(offset))
                        .unwrap_or(0)
                };
                if !chain.get_mut(level).ensure_page_commitment(precommitted) {
                    return Resolution::Retry(RetryReason::NeedMemory {
                        priority: chain.get(level).cache().priority(),
                    });
                }
                let Some(ppn) = reservation.take() else {
                    return Resolution::Error(VmError::NoMemory);
                };
                chain
                    .get_mut(level)
                    .insert_page(offset, VmPage::new(ppn, PageState::Active));
                FaultStats::bump(&self.stats().zero_fill);
                (level, ppn)
            }
        };

        // 共享文件页只读映射直到第一次写入，写入时标记为已修改
        let file_backed = matches!(chain.get(level).cache().kind(), CacheKind::FileBacked { .. });
        if level == 0 && file_backed && request.is_write {
            if let Some(page) = chain.top_mut().lookup_page_mut(offset) {
                if page.wired_count() == 0 {
                    page.set_state(PageState::Modified);
                }
            }
        }
        let writable = level == 0 && (request.is_write || !file_backed);

        let wired = if request.wire {
            let cache = chain.get_mut(level);
            if let Some(page) = cache.lookup_page_mut(offset) {
                page.wire();
            }
            Some(WiredPage {
                cache: cache.cache().clone(),
                offset,
            })
        } else {
            None
        };

        if let Err(err) = self.install_mapping(space, area, address, ppn, writable, true, reservation) {
            if wired.is_some() {
                if let Some(page) = chain.get_mut(level).lookup_page_mut(offset) {
                    page.unwire();
                }
            }
            return Resolution::Error(err);
        }
        drop(chain);
        Resolution::Resolved(FaultedPage { ppn, wired })
    }

    /// 写时复制之后，绑定在同一顶层缓存上的其它区域若映射着旧页，解除之
    fn unmap_stale_copies(&self, top: &LockedCache, offset: usize, old: Ppn, ours: PageMapping) {
        for mapping in self.mapping_table().mappings_of(old) {
            if mapping == ours {
                continue;
            }
            let bound_to_top = top.areas().iter().any(|link| {
                link.space == mapping.space && link.address_of(offset) == Some(mapping.address)
            });
            if bound_to_top {
                self.unmap_stale_mapping(mapping, old);
            }
        }
    }

    /// 从后备存储读入忙页；调用者不持有任何锁
    ///
    /// 成功时清除忙标志；失败时页从缓存中移除并释放。读入期间缓存
    /// 若已缩小到不再覆盖该偏移，页同样被丢弃。
    fn read_in(&self, cache: &Arc<Cache>, store: &dyn BackingStore, offset: usize, ppn: Ppn) -> VmResult<()> {
        let mut buffer = vec![0u8; PAGE_SIZE];
        let result = store.read_at(offset, &mut buffer);
        if let Ok(len) = result {
            self.allocator().write_page(ppn, 0, &buffer[..len.min(PAGE_SIZE)]);
        }

        let mut locked = cache.lock();
        let discarded = if result.is_ok() && locked.covers(offset) {
            if let Some(page) = locked.lookup_page_mut(offset) {
                page.set_busy(false);
            }
            None
        } else {
            locked.remove_page(offset)
        };
        drop(locked);
        if let Some(page) = discarded {
            self.allocator().free_page(page.ppn());
        }

        result.map(|_| ()).map_err(|code| {
            log::warn!(
                "vm: reading offset {:#x} of cache {} failed: {}",
                offset,
                cache.id(),
                code
            );
            VmError::Io(code)
        })
    }

    /// 安装映射
    ///
    /// 同一页已映射时只在需要写权限时调整保护位；映射着别的页时先解除。
    /// `tracked` 为假的页（设备内存）不记入反向映射。
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn install_mapping(
        &self,
        space: &AddressSpace,
        area: &Area,
        address: usize,
        ppn: Ppn,
        writable: bool,
        tracked: bool,
        reservation: &mut PageReservation,
    ) -> VmResult<()> {
        let mut protection = area.page_protection(address);
        if !writable {
            protection = protection.without_write();
        }
        let mapping = PageMapping::new(space.id(), address);
        let mut map = space.map().lock();
        match map.query(address) {
            Some(existing) if existing.ppn == ppn => {
                if writable && existing.protection != protection {
                    map.protect(address, address + PAGE_SIZE, protection);
                    map.flush();
                }
            }
            existing => {
                if let Some(existing) = existing {
                    self.check_page_known(existing.ppn, space.id(), address);
                    map.unmap(address, address + PAGE_SIZE);
                    map.flush();
                    self.mapping_table().remove(existing.ppn, mapping);
                }
                map.map(address, ppn, protection, reservation)?;
                if tracked {
                    self.mapping_table().add(ppn, mapping);
                }
            }
        }
        Ok(())
    }
}
