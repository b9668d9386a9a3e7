//! 转换表接口
//!
//! 硬件页表驱动，每个地址空间一个实例。驱动自身不加锁，
//! [`AddressSpace`](crate::AddressSpace) 用一把独立的自旋锁保护它，
//! 该锁总是在区域与缓存锁之后获取。

use alloc::vec::Vec;

use bitflags::bitflags;
use uapi::area::AreaProtection;

use crate::address::Ppn;
use crate::error::VmResult;
use crate::page::PageReservation;

bitflags! {
    /// 硬件维护的页标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// 页被访问过
        const ACCESSED = 1 << 0;
        /// 页被写过
        const MODIFIED = 1 << 1;
    }
}

/// 一条映射的查询结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingInfo {
    /// 物理页
    pub ppn: Ppn,
    /// 当前保护位
    pub protection: AreaProtection,
    /// 硬件标志
    pub flags: PageFlags,
}

/// 被解除的映射
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnmappedPage {
    /// 虚拟地址
    pub address: usize,
    /// 物理页
    pub ppn: Ppn,
    /// 解除前的硬件标志
    pub flags: PageFlags,
}

/// 硬件页表驱动
pub trait TranslationMap: Send {
    /// 建立一条映射，需要新页表页时从 `reservation` 中取
    fn map(
        &mut self,
        address: usize,
        ppn: Ppn,
        protection: AreaProtection,
        reservation: &mut PageReservation,
    ) -> VmResult<()>;

    /// 解除 `[start, end)` 内的全部映射
    fn unmap(&mut self, start: usize, end: usize) -> Vec<UnmappedPage>;

    /// 修改 `[start, end)` 内已有映射的保护位
    fn protect(&mut self, start: usize, end: usize, protection: AreaProtection);

    /// 查询映射
    fn query(&self, address: usize) -> Option<MappingInfo>;

    /// 清除硬件标志
    fn clear_flags(&mut self, address: usize, flags: PageFlags);

    /// 映射 `[start, end)` 最多需要分配的页表页数
    fn max_pages_need(&self, start: usize, end: usize) -> usize;

    /// 已映射的字节数
    fn mapped_size(&self) -> usize;

    /// 刷新 TLB
    fn flush(&mut self);
}
