//! 预留页
//!
//! 缺页与常驻区域创建必须在持锁之前把可能用到的物理页（包括转换表
//! 需要的页表页）分配好，持锁期间只从预留中取页。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;

use crate::address::Ppn;
use crate::error::{VmError, VmResult};
use crate::page::{PageAllocator, PageState};
use crate::platform::{LowResource, VmPlatform};

/// 预留时分配不到页的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveMode {
    /// 立即失败
    NoWait,
    /// 通知低内存并一直等待
    Wait,
    /// 通知低内存并等待至多给定时间
    WaitFor(Duration),
}

// ============================================================================
// PageReservation - 预留页的 RAII 封装
// ============================================================================

/// 一组已分配但尚未使用的清零页
///
/// `Drop` 时归还所有未取走的页。
pub struct PageReservation {
    allocator: Arc<dyn PageAllocator>,
    pages: Vec<Ppn>,
}

impl PageReservation {
    /// 空预留
    pub fn empty(allocator: Arc<dyn PageAllocator>) -> Self {
        Self {
            allocator,
            pages: Vec::new(),
        }
    }

    /// 预留 `count` 页
    pub fn reserve(
        allocator: Arc<dyn PageAllocator>,
        platform: &dyn VmPlatform,
        count: usize,
        mode: ReserveMode,
    ) -> VmResult<Self> {
        let mut reservation = Self::empty(allocator);
        reservation.top_up(platform, count, mode)?;
        Ok(reservation)
    }

    /// 补足到至少 `count` 页
    ///
    /// 失败时已经补进来的页保留在预留中，随预留一起释放。
    pub fn top_up(&mut self, platform: &dyn VmPlatform, count: usize, mode: ReserveMode) -> VmResult<()> {
        let deadline = match mode {
            ReserveMode::WaitFor(timeout) => platform.now().checked_add(timeout),
            _ => None,
        };
        while self.pages.len() < count {
            if let Some(ppn) = self.allocator.allocate_page(PageState::Clear) {
                self.pages.push(ppn);
                continue;
            }
            if mode == ReserveMode::NoWait {
                return Err(VmError::NoMemory);
            }
            platform.low_resource(LowResource::Pages, count - self.pages.len());
            if deadline.is_some_and(|deadline| platform.now() >= deadline) {
                log::warn!(
                    "page reservation: {} of {} pages after timeout",
                    self.pages.len(),
                    count
                );
                return Err(VmError::NoMemory);
            }
            platform.yield_now();
        }
        Ok(())
    }

    /// 取走一页
    pub fn take(&mut self) -> Option<Ppn> {
        self.pages.pop()
    }

    /// 剩余页数
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// 是否已用完
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl Drop for PageReservation {
    fn drop(&mut self) {
        for ppn in self.pages.drain(..) {
            self.allocator.free_page(ppn);
        }
    }
}

// ============================================================================
// ContiguousRun - 物理连续页的 RAII 封装
// ============================================================================

/// 一段物理连续的页，按顺序逐页取走
///
/// `Drop` 时归还尚未取走的页。
pub struct ContiguousRun {
    allocator: Arc<dyn PageAllocator>,
    start: Ppn,
    count: usize,
    consumed: usize,
}

impl ContiguousRun {
    /// 分配 `count` 个物理连续页，失败时不占用任何页
    pub fn allocate(allocator: Arc<dyn PageAllocator>, hint: Option<Ppn>, count: usize) -> VmResult<Self> {
        let start = allocator
            .allocate_contiguous_run(PageState::Wired, hint, count)
            .ok_or(VmError::NoMemory)?;
        Ok(Self {
            allocator,
            start,
            count,
            consumed: 0,
        })
    }

    /// 起始页
    pub fn start(&self) -> Ppn {
        self.start
    }

    /// 取走下一页
    pub fn next_page(&mut self) -> Option<Ppn> {
        if self.consumed == self.count {
            return None;
        }
        let ppn = self.start + self.consumed;
        self.consumed += 1;
        Some(ppn)
    }
}

impl Drop for ContiguousRun {
    fn drop(&mut self) {
        for idx in self.consumed..self.count {
            self.allocator.free_page(self.start + idx);
        }
    }
}
