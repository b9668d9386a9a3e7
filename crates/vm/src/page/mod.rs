//! 物理页描述与分配器接口
//!
//! 物理页分配器是外部协作者，VM 只通过 [`PageAllocator`] 使用它。
//! 缓存中每个页由一个 [`VmPage`] 描述，记录状态、忙标志、常驻计数与
//! 插入缓存时设置的归属。

mod reservation;

pub use reservation::{ContiguousRun, PageReservation, ReserveMode};

use crate::address::Ppn;
use crate::cache::CacheId;

/// 页状态
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// 空闲
    Free = 0,
    /// 已清零，可直接使用
    Clear = 1,
    /// 活跃
    Active = 2,
    /// 不活跃，可回收
    Inactive = 3,
    /// 已修改，回收前需要写回
    Modified = 4,
    /// 常驻
    Wired = 5,
    /// 已分配但未使用
    Unused = 6,
}

impl PageState {
    /// 从数值还原
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => PageState::Free,
            1 => PageState::Clear,
            2 => PageState::Active,
            3 => PageState::Inactive,
            4 => PageState::Modified,
            5 => PageState::Wired,
            6 => PageState::Unused,
            _ => return None,
        })
    }

    /// 简短名称
    pub fn as_str(self) -> &'static str {
        match self {
            PageState::Free => "free",
            PageState::Clear => "clear",
            PageState::Active => "active",
            PageState::Inactive => "inactive",
            PageState::Modified => "modified",
            PageState::Wired => "wired",
            PageState::Unused => "unused",
        }
    }
}

/// 物理页分配器
pub trait PageAllocator: Send + Sync {
    /// 分配一页，内容清零
    fn allocate_page(&self, state: PageState) -> Option<Ppn>;

    /// 分配 `count` 个物理连续页，可以给出起始页提示
    fn allocate_contiguous_run(&self, state: PageState, hint: Option<Ppn>, count: usize) -> Option<Ppn>;

    /// 释放一页
    fn free_page(&self, ppn: Ppn);

    /// 查询页状态；不受分配器管理的页（如设备内存）返回 None
    fn lookup_page(&self, ppn: Ppn) -> Option<PageState>;

    /// 总页数
    fn total_pages(&self) -> usize;

    /// 空闲页数
    fn free_pages(&self) -> usize;

    /// 页内容清零
    fn clear_page(&self, ppn: Ppn);

    /// 复制整页内容
    fn copy_page(&self, from: Ppn, to: Ppn);

    /// 读取页内容
    fn read_page(&self, ppn: Ppn, offset: usize, buf: &mut [u8]);

    /// 写入页内容
    fn write_page(&self, ppn: Ppn, offset: usize, data: &[u8]);
}

/// 缓存中的页描述符
#[derive(Debug)]
pub struct VmPage {
    ppn: Ppn,
    state: PageState,
    busy: bool,
    wired_count: u32,
    owner: Option<(CacheId, usize)>,
}

impl VmPage {
    /// 新页，尚未插入任何缓存
    pub fn new(ppn: Ppn, state: PageState) -> Self {
        Self {
            ppn,
            state,
            busy: false,
            wired_count: 0,
            owner: None,
        }
    }

    /// 新的忙页（正在读入）
    pub fn new_busy(ppn: Ppn) -> Self {
        let mut page = Self::new(ppn, PageState::Active);
        page.busy = true;
        page
    }

    /// 物理页号
    pub fn ppn(&self) -> Ppn {
        self.ppn
    }

    /// 页状态
    pub fn state(&self) -> PageState {
        self.state
    }

    /// 设置页状态
    pub fn set_state(&mut self, state: PageState) {
        self.state = state;
    }

    /// 是否忙（I/O 进行中）
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// 设置忙标志
    pub fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    /// 常驻计数
    pub fn wired_count(&self) -> u32 {
        self.wired_count
    }

    /// 增加常驻计数
    pub fn wire(&mut self) {
        self.wired_count += 1;
        self.state = PageState::Wired;
    }

    /// 减少常驻计数，返回剩余计数
    pub fn unwire(&mut self) -> u32 {
        debug_assert!(self.wired_count > 0, "unwire of page {} that is not wired", self.ppn);
        self.wired_count = self.wired_count.saturating_sub(1);
        if self.wired_count == 0 && self.state == PageState::Wired {
            self.state = PageState::Active;
        }
        self.wired_count
    }

    /// 所属缓存及偏移
    pub fn owner(&self) -> Option<(CacheId, usize)> {
        self.owner
    }

    pub(crate) fn set_owner(&mut self, owner: Option<(CacheId, usize)>) {
        self.owner = owner;
    }
}
