//! 地址与页号工具
//!
//! VM 核心只关心页粒度：虚拟地址直接使用 `usize`，物理页用 [`Ppn`] 区分。

use core::fmt;
use core::ops::Add;

/// 页大小的位移
pub const PAGE_SHIFT: usize = 12;
/// 页大小（字节）
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// 物理页号
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Ppn(pub usize);

impl Ppn {
    /// 物理页号的数值
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// 页的起始物理地址
    pub const fn start_addr(self) -> usize {
        self.0 << PAGE_SHIFT
    }

    /// 包含给定物理地址的页
    pub const fn from_addr_floor(paddr: usize) -> Self {
        Ppn(paddr >> PAGE_SHIFT)
    }
}

impl Add<usize> for Ppn {
    type Output = Ppn;

    fn add(self, pages: usize) -> Ppn {
        Ppn(self.0 + pages)
    }
}

impl fmt::Display for Ppn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// 是否按页对齐
#[inline]
pub const fn is_page_aligned(value: usize) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

/// 向下对齐到页边界
#[inline]
pub const fn page_align_down(value: usize) -> usize {
    value & !(PAGE_SIZE - 1)
}

/// 向上对齐到页边界，溢出时返回 None
#[inline]
pub fn page_align_up(value: usize) -> Option<usize> {
    value
        .checked_add(PAGE_SIZE - 1)
        .map(|v| v & !(PAGE_SIZE - 1))
}

/// 已对齐字节数对应的页数
#[inline]
pub const fn pages_in(bytes: usize) -> usize {
    bytes >> PAGE_SHIFT
}

/// 按页遍历 `[start, end)`
pub fn pages_between(start: usize, end: usize) -> impl Iterator<Item = usize> {
    (start..end).step_by(PAGE_SIZE)
}
