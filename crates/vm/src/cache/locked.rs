//! 已加锁的缓存
//!
//! [`LockedCache`] 持有缓存的 `Arc` 并占有其锁，可以在函数间移动，
//! 解锁在 `Drop`（或 [`LockedCache::unlock`]）中完成。

use alloc::sync::Arc;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use crate::address::PAGE_SIZE;
use crate::cache::{Cache, CacheInner, CacheKind};
use crate::error::{VmError, VmResult};
use crate::page::VmPage;

/// 占有锁的缓存句柄
pub(crate) struct LockedCache {
    cache: Arc<Cache>,
}

impl LockedCache {
    /// 获取缓存锁
    ///
    /// 同时持有多把缓存锁时必须自顶向下获取，见 [`CacheChain`](super::CacheChain)。
    pub(crate) fn lock(cache: Arc<Cache>) -> Self {
        core::mem::forget(cache.state.lock());
        Self { cache }
    }

    /// 缓存句柄
    pub(crate) fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// 解锁并交还句柄
    pub(crate) fn unlock(self) -> Arc<Cache> {
        let this = ManuallyDrop::new(self);
        // Safety: lock() 中遗忘的守卫由本对象代表，此处恰好释放一次，
        // 之后通过 ptr::read 取走 Arc，ManuallyDrop 保证不会再执行 Drop。
        unsafe {
            this.cache.state.force_unlock();
            core::ptr::read(&this.cache)
        }
    }

    // ========================================================================
    // 页索引
    // ========================================================================

    /// 插入页并设置归属
    pub(crate) fn insert_page(&mut self, offset: usize, mut page: VmPage) {
        debug_assert!(self.covers(offset), "cache {}: offset {:#x} out of range", self.cache.id, offset);
        page.set_owner(Some((self.cache.id, offset)));
        let previous = self.pages.insert(offset, page);
        debug_assert!(previous.is_none(), "cache {}: page at {:#x} inserted twice", self.cache.id, offset);
    }

    /// 移除页并清除归属，不释放物理页
    pub(crate) fn remove_page(&mut self, offset: usize) -> Option<VmPage> {
        let mut page = self.pages.remove(&offset)?;
        page.set_owner(None);
        Some(page)
    }

    /// 丢弃 `[start, end)` 内的页，返回释放的页数
    ///
    /// 常驻页和忙页跳过。调用者必须已解除这些页的映射。
    pub(crate) fn discard_range(&mut self, start: usize, end: usize) -> usize {
        let offsets: alloc::vec::Vec<usize> = self.pages.range(start..end).map(|(off, _)| *off).collect();
        let mut freed = 0;
        for offset in offsets {
            let Some(page) = self.pages.get(&offset) else {
                continue;
            };
            if page.is_busy() || page.wired_count() > 0 {
                log::warn!(
                    "cache {}: keeping {} page at {:#x} during discard",
                    self.cache.id,
                    if page.is_busy() { "busy" } else { "wired" },
                    offset
                );
                continue;
            }
            if let Some(page) = self.remove_page(offset) {
                self.cache.env.allocator.free_page(page.ppn());
                freed += 1;
            }
        }
        if freed > 0 && self.cache.is_overcommitting() {
            let target = self.pages.len() * PAGE_SIZE;
            if self.committed > target {
                // 缩减提交不会失败
                let _ = self.commit(target);
            }
        }
        freed
    }

    // ========================================================================
    // 提交
    // ========================================================================

    /// 将提交调整到 `target` 字节，增加部分以非阻塞方式向记账器申请
    ///
    /// 非匿名缓存没有提交，直接成功。
    pub(crate) fn commit(&mut self, target: usize) -> VmResult<()> {
        if !matches!(self.cache.kind, CacheKind::Anonymous { .. }) {
            return Ok(());
        }
        let current = self.committed;
        if target > current {
            self.cache
                .env
                .accountant
                .try_reserve_non_blocking(target - current, self.cache.priority)
                .map_err(|_| VmError::NoMemory)?;
        } else if target < current {
            self.cache.env.accountant.unreserve(current - target);
        }
        self.committed = target;
        Ok(())
    }

    /// 接收调用者已经向记账器提交的额度
    pub(crate) fn adopt_commitment(&mut self, amount: usize) {
        self.committed += amount;
    }

    /// 保证再插入一页后提交仍然足够
    ///
    /// 只有按需提交的缓存需要处理；先用调用者预先提交的额度，
    /// 不够时非阻塞申请。返回 false 表示需要放开锁后阻塞申请。
    pub(crate) fn ensure_page_commitment(&mut self, precommitted: &mut usize) -> bool {
        if !self.cache.is_overcommitting() {
            return true;
        }
        let needed = (self.pages.len() + 1) * PAGE_SIZE;
        if self.committed >= needed {
            return true;
        }
        if *precommitted >= PAGE_SIZE {
            *precommitted -= PAGE_SIZE;
            self.adopt_commitment(PAGE_SIZE);
            return true;
        }
        self.commit(needed).is_ok()
    }

    // ========================================================================
    // 范围
    // ========================================================================

    /// 调整逻辑终点
    ///
    /// 增长时（非按需提交的缓存）先提交，失败则不做任何改变；
    /// 缩小时丢弃尾部的页并归还提交。
    pub(crate) fn resize(&mut self, new_end: usize) -> VmResult<()> {
        let old_end = self.virtual_end;
        let new_size = new_end - self.virtual_base;
        if new_end > old_end {
            if !self.cache.is_overcommitting() {
                self.commit(new_size)?;
            }
            self.virtual_end = new_end;
            return Ok(());
        }
        if new_end < old_end {
            self.discard_range(new_end, old_end);
            self.virtual_end = new_end;
            if !self.cache.is_overcommitting() {
                self.commit(new_size)?;
            }
        }
        Ok(())
    }

    /// 抬高逻辑起点，丢弃新起点之前的页
    pub(crate) fn rebase(&mut self, new_base: usize) -> VmResult<()> {
        debug_assert!(new_base >= self.virtual_base && new_base <= self.virtual_end);
        let old_base = self.virtual_base;
        self.discard_range(old_base, new_base);
        self.virtual_base = new_base;
        let new_size = self.virtual_end - new_base;
        if !self.cache.is_overcommitting() {
            self.commit(new_size)?;
        }
        Ok(())
    }

    // ========================================================================
    // 链接
    // ========================================================================

    /// 设置父缓存，返回原来的父缓存句柄
    ///
    /// 返回的句柄必须在释放全部锁之后再丢弃。
    pub(crate) fn set_source(&mut self, source: Option<Arc<Cache>>) -> Option<Arc<Cache>> {
        core::mem::replace(&mut self.source, source)
    }

    /// 登记子缓存
    pub(crate) fn add_consumer(&mut self, consumer: &Arc<Cache>) {
        self.consumers.push((consumer.id, Arc::downgrade(consumer)));
    }
}

impl Deref for LockedCache {
    type Target = CacheInner;

    fn deref(&self) -> &CacheInner {
        // Safety: 本对象存在期间锁一直被占有
        unsafe { &*self.cache.state.data_ptr() }
    }
}

impl DerefMut for LockedCache {
    fn deref_mut(&mut self) -> &mut CacheInner {
        // Safety: 同上，且 &mut self 保证独占
        unsafe { &mut *self.cache.state.data_ptr() }
    }
}

impl Drop for LockedCache {
    fn drop(&mut self) {
        // Safety: lock() 中遗忘的守卫由本对象代表
        unsafe { self.cache.state.force_unlock() };
    }
}
