//! 缓存层次
//!
//! 缓存是写时复制共享的单位：按偏移索引一组物理页，可以有一个
//! source（父缓存）和若干 consumer（子缓存）。区域绑定到某个缓存的
//! 某个偏移上；私有映射在源缓存之上叠加一个匿名缓存。
//!
//! # 所有权
//!
//! - `Arc<Cache>` 就是句柄：区域、子缓存的 source 链接以及遍历中的
//!   临时引用各持有一个。
//! - consumer 列表和全局登记表只持有 `Weak`，不延长生命周期。
//! - 最后一个句柄释放时，[`Drop`] 归还页、提交额度，并把自己从
//!   source 的 consumer 列表中摘除。
//!
//! # 加锁
//!
//! 缓存内部状态只能通过 `LockedCache` 访问；沿 source 链加锁只能
//! 通过 `CacheChain`，它只能从已加锁的地址空间构造，并且只能向下扩展。

mod chain;
mod locked;
mod store;

pub(crate) use chain::CacheChain;
pub(crate) use locked::LockedCache;
pub use store::{BackingStore, StoreFault};

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};

use sync::SpinLock;

use crate::accountant::{Accountant, MemoryPriority};
use crate::address::Ppn;
use crate::area::AreaId;
use crate::page::{PageAllocator, VmPage};
use crate::platform::VmPlatform;
use crate::space::SpaceId;

/// 缓存编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheId(pub u64);

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 缓存种类
///
/// 种类集合是封闭的，缺页时按种类穷尽匹配，而不是虚函数分派。
pub enum CacheKind {
    /// 匿名内存；`overcommit` 为真时按页逐个提交，否则创建时整体提交
    Anonymous {
        /// 是否按需提交
        overcommit: bool,
    },
    /// 设备内存，偏移直接对应 `base` 起的物理页，不持有页描述符
    Device {
        /// 起始物理页
        base: Ppn,
    },
    /// 文件后备
    FileBacked {
        /// 后备存储
        store: Arc<dyn BackingStore>,
    },
    /// 只占位，任何访问都失败
    Null,
}

impl CacheKind {
    /// 种类标签
    pub fn tag(&self) -> CacheKindTag {
        match self {
            CacheKind::Anonymous { .. } => CacheKindTag::Anonymous,
            CacheKind::Device { .. } => CacheKindTag::Device,
            CacheKind::FileBacked { .. } => CacheKindTag::FileBacked,
            CacheKind::Null => CacheKindTag::Null,
        }
    }
}

impl fmt::Debug for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKind::Anonymous { overcommit } => f
                .debug_struct("Anonymous")
                .field("overcommit", overcommit)
                .finish(),
            CacheKind::Device { base } => f.debug_struct("Device").field("base", base).finish(),
            CacheKind::FileBacked { .. } => f.write_str("FileBacked"),
            CacheKind::Null => f.write_str("Null"),
        }
    }
}

/// 缓存种类标签，用于统计与调试输出
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKindTag {
    /// 匿名
    Anonymous,
    /// 设备
    Device,
    /// 文件
    FileBacked,
    /// 占位
    Null,
}

impl CacheKindTag {
    /// 简短名称
    pub fn as_str(self) -> &'static str {
        match self {
            CacheKindTag::Anonymous => "anon",
            CacheKindTag::Device => "device",
            CacheKindTag::FileBacked => "file",
            CacheKindTag::Null => "null",
        }
    }
}

/// 缓存记录的区域绑定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaLink {
    /// 区域所在的地址空间
    pub space: SpaceId,
    /// 区域
    pub area: AreaId,
    /// 区域起始虚拟地址
    pub base: usize,
    /// 区域大小
    pub size: usize,
    /// 区域起点对应的缓存偏移
    pub cache_offset: usize,
}

impl AreaLink {
    /// 缓存偏移在该区域中的虚拟地址
    pub fn address_of(&self, offset: usize) -> Option<usize> {
        (offset >= self.cache_offset && offset - self.cache_offset < self.size)
            .then(|| self.base + (offset - self.cache_offset))
    }
}

/// 缓存操作依赖的协作者
#[derive(Clone)]
pub(crate) struct CacheEnv {
    pub(crate) allocator: Arc<dyn PageAllocator>,
    pub(crate) accountant: Arc<Accountant>,
}

/// 缓存状态快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    /// 编号
    pub id: CacheId,
    /// 种类
    pub kind: CacheKindTag,
    /// 逻辑范围起点
    pub virtual_base: usize,
    /// 逻辑范围终点
    pub virtual_end: usize,
    /// 页数
    pub page_count: usize,
    /// 忙页数
    pub busy_pages: usize,
    /// 已提交字节数
    pub committed: usize,
    /// 句柄数
    pub ref_count: usize,
    /// 子缓存数
    pub consumer_count: usize,
    /// 绑定的区域数
    pub area_count: usize,
    /// 父缓存
    pub source: Option<CacheId>,
    /// 临时缓存（页可在压力下丢弃）
    pub temporary: bool,
    /// 不参与页面回收扫描
    pub scan_skip: bool,
}

/// 缓存
pub struct Cache {
    id: CacheId,
    kind: CacheKind,
    priority: MemoryPriority,
    state: SpinLock<CacheInner>,
    busy_waiters: AtomicUsize,
    env: CacheEnv,
}

/// 受缓存锁保护的状态
pub struct CacheInner {
    virtual_base: usize,
    virtual_end: usize,
    pages: BTreeMap<usize, VmPage>,
    committed: usize,
    source: Option<Arc<Cache>>,
    consumers: Vec<(CacheId, Weak<Cache>)>,
    areas: Vec<AreaLink>,
    temporary: bool,
    scan_skip: bool,
}

impl Cache {
    /// 创建缓存；`committed` 必须已经向记账器提交过
    pub(crate) fn new(
        id: CacheId,
        kind: CacheKind,
        range: Range<usize>,
        committed: usize,
        priority: MemoryPriority,
        env: CacheEnv,
    ) -> Arc<Self> {
        let temporary = matches!(kind, CacheKind::Anonymous { .. });
        let scan_skip = matches!(kind, CacheKind::Device { .. } | CacheKind::Null);
        Arc::new(Self {
            id,
            kind,
            priority,
            state: SpinLock::new(CacheInner {
                virtual_base: range.start,
                virtual_end: range.end,
                pages: BTreeMap::new(),
                committed,
                source: None,
                consumers: Vec::new(),
                areas: Vec::new(),
                temporary,
                scan_skip,
            }),
            busy_waiters: AtomicUsize::new(0),
            env,
        })
    }

    /// 编号
    pub fn id(&self) -> CacheId {
        self.id
    }

    /// 种类
    pub fn kind(&self) -> &CacheKind {
        &self.kind
    }

    /// 种类标签
    pub fn tag(&self) -> CacheKindTag {
        self.kind.tag()
    }

    /// 是否按页逐个提交
    pub fn is_overcommitting(&self) -> bool {
        matches!(self.kind, CacheKind::Anonymous { overcommit: true })
    }

    /// 提交时使用的优先级
    pub fn priority(&self) -> MemoryPriority {
        self.priority
    }

    /// 正在等待忙页的线程数
    pub fn busy_waiters(&self) -> usize {
        self.busy_waiters.load(Ordering::Acquire)
    }

    /// 加锁
    pub(crate) fn lock(self: &Arc<Self>) -> LockedCache {
        LockedCache::lock(self.clone())
    }

    /// 等待偏移处的页不再忙
    ///
    /// 调用者不能持有任何 VM 锁。页被移除也视为等待结束。
    pub(crate) fn wait_for_unbusy(&self, offset: usize, platform: &dyn VmPlatform) {
        self.busy_waiters.fetch_add(1, Ordering::AcqRel);
        loop {
            let busy = self
                .state
                .lock()
                .pages
                .get(&offset)
                .is_some_and(VmPage::is_busy);
            if !busy {
                break;
            }
            platform.yield_now();
        }
        self.busy_waiters.fetch_sub(1, Ordering::AcqRel);
    }

    /// 状态快照
    pub fn info(self: &Arc<Self>) -> CacheInfo {
        let ref_count = Arc::strong_count(self);
        let inner = self.state.lock();
        CacheInfo {
            id: self.id,
            kind: self.tag(),
            virtual_base: inner.virtual_base,
            virtual_end: inner.virtual_end,
            page_count: inner.pages.len(),
            busy_pages: inner.pages.values().filter(|p| p.is_busy()).count(),
            committed: inner.committed,
            ref_count,
            consumer_count: inner.consumers.len(),
            area_count: inner.areas.len(),
            source: inner.source.as_ref().map(|s| s.id),
            temporary: inner.temporary,
            scan_skip: inner.scan_skip,
        }
    }

    /// 父缓存句柄
    pub fn source(&self) -> Option<Arc<Cache>> {
        self.state.lock().source.clone()
    }

    /// 偏移处页的快照：(物理页, 常驻计数)
    pub fn page_at(&self, offset: usize) -> Option<(Ppn, u32)> {
        self.state
            .lock()
            .pages
            .get(&offset)
            .map(|p| (p.ppn(), p.wired_count()))
    }

    /// 页数
    pub fn page_count(&self) -> usize {
        self.state.lock().pages.len()
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        let inner = self.state.get_mut();
        let pages = core::mem::take(&mut inner.pages);
        let freed = pages.len();
        for (_, page) in pages {
            debug_assert!(!page.is_busy(), "cache {}: dropping busy page", self.id);
            self.env.allocator.free_page(page.ppn());
        }
        let committed = core::mem::take(&mut inner.committed);
        self.env.accountant.unreserve(committed);

        let source = inner.source.take();
        if let Some(source) = &source {
            source.state.lock().consumers.retain(|(id, _)| *id != self.id);
        }
        log::trace!(
            "cache {}: destroyed, freed {} pages and {} committed bytes",
            self.id,
            freed,
            committed
        );
        // 父缓存在所有锁释放之后才放手，级联销毁不会在持锁时发生
        drop(source);
    }
}

impl CacheInner {
    /// 逻辑范围起点
    pub fn virtual_base(&self) -> usize {
        self.virtual_base
    }

    /// 逻辑范围终点
    pub fn virtual_end(&self) -> usize {
        self.virtual_end
    }

    /// 偏移是否落在逻辑范围内
    pub fn covers(&self, offset: usize) -> bool {
        offset >= self.virtual_base && offset < self.virtual_end
    }

    /// 查找页；范围外的页不可见
    pub fn lookup_page(&self, offset: usize) -> Option<&VmPage> {
        if !self.covers(offset) {
            return None;
        }
        self.pages.get(&offset)
    }

    /// 查找页（可变）
    pub fn lookup_page_mut(&mut self, offset: usize) -> Option<&mut VmPage> {
        if !self.covers(offset) {
            return None;
        }
        self.pages.get_mut(&offset)
    }

    /// 遍历 `[start, end)` 内的页
    pub fn pages_in(&self, start: usize, end: usize) -> impl Iterator<Item = (&usize, &VmPage)> {
        self.pages.range(start..end)
    }

    /// 页数
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// 已提交字节数
    pub fn committed(&self) -> usize {
        self.committed
    }

    /// 父缓存
    pub fn source(&self) -> Option<&Arc<Cache>> {
        self.source.as_ref()
    }

    /// 是否有子缓存
    pub fn has_consumers(&self) -> bool {
        !self.consumers.is_empty()
    }

    /// 子缓存数
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// 绑定的区域
    pub fn areas(&self) -> &[AreaLink] {
        &self.areas
    }

    /// 是否临时缓存
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// 是否跳过回收扫描
    pub fn scan_skip(&self) -> bool {
        self.scan_skip
    }

    /// 设置是否跳过回收扫描
    pub fn set_scan_skip(&mut self, skip: bool) {
        self.scan_skip = skip;
    }

    pub(crate) fn add_area(&mut self, link: AreaLink) {
        debug_assert!(self.areas.iter().all(|l| l.area != link.area));
        self.areas.push(link);
    }

    pub(crate) fn remove_area(&mut self, area: AreaId) -> Option<AreaLink> {
        let idx = self.areas.iter().position(|l| l.area == area)?;
        Some(self.areas.swap_remove(idx))
    }

    pub(crate) fn update_area(&mut self, link: AreaLink) {
        match self.areas.iter_mut().find(|l| l.area == link.area) {
            Some(existing) => *existing = link,
            None => self.areas.push(link),
        }
    }
}
