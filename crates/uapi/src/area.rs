//! 内存区域相关的用户态可见定义

use bitflags::bitflags;

bitflags! {
    /// 区域保护位
    ///
    /// 低四位描述用户态权限，其后四位描述内核态权限。
    /// 用户态可访问的区域总是隐含对应的内核态权限（见 [`AreaProtection::with_kernel_access`]）。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AreaProtection: u32 {
        /// 用户可读
        const READ = 1 << 0;
        /// 用户可写
        const WRITE = 1 << 1;
        /// 用户可执行
        const EXECUTE = 1 << 2;
        /// 用户栈
        const STACK = 1 << 3;
        /// 内核可读
        const KERNEL_READ = 1 << 4;
        /// 内核可写
        const KERNEL_WRITE = 1 << 5;
        /// 内核可执行
        const KERNEL_EXECUTE = 1 << 6;
        /// 内核栈
        const KERNEL_STACK = 1 << 7;
        /// 允许其它地址空间克隆此区域
        const CLONEABLE = 1 << 8;
        /// 复制区域时共享而不是写时复制
        const SHARED = 1 << 9;
    }
}

impl AreaProtection {
    /// 全部用户态权限位
    pub const USER_MASK: Self = Self::READ
        .union(Self::WRITE)
        .union(Self::EXECUTE)
        .union(Self::STACK);

    /// 全部内核态权限位
    pub const KERNEL_MASK: Self = Self::KERNEL_READ
        .union(Self::KERNEL_WRITE)
        .union(Self::KERNEL_EXECUTE)
        .union(Self::KERNEL_STACK);

    /// 用户或内核任一方可写
    pub fn is_writable(self) -> bool {
        self.intersects(Self::WRITE | Self::KERNEL_WRITE)
    }

    /// 用户态是否可以访问
    pub fn is_user_accessible(self) -> bool {
        self.intersects(Self::USER_MASK)
    }

    /// 去掉所有写权限
    pub fn without_write(self) -> Self {
        self.difference(Self::WRITE | Self::KERNEL_WRITE)
    }

    /// 补齐用户权限隐含的内核权限
    ///
    /// 没有任何用户权限时，视为内核读写区域。
    pub fn with_kernel_access(self) -> Self {
        if !self.is_user_accessible() {
            if !self.intersects(Self::KERNEL_MASK) {
                return self | Self::KERNEL_READ | Self::KERNEL_WRITE;
            }
            return self;
        }
        let mut fixed = self;
        if self.contains(Self::READ) {
            fixed |= Self::KERNEL_READ;
        }
        if self.contains(Self::WRITE) {
            fixed |= Self::KERNEL_WRITE;
        }
        if self.contains(Self::EXECUTE) {
            fixed |= Self::KERNEL_EXECUTE;
        }
        if self.contains(Self::STACK) {
            fixed |= Self::KERNEL_STACK;
        }
        fixed
    }
}

/// 区域的放置方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpec {
    /// 任意空闲位置
    Any,
    /// 必须恰好位于给定地址
    Exact(usize),
    /// 不低于给定地址的第一个空闲位置
    Base(usize),
}

/// 区域的常驻（wiring）策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WiringMode {
    /// 按需缺页，可被回收
    NoLock,
    /// 按需缺页，缺入后不回收
    LazyLock,
    /// 创建时全部分配并固定
    FullLock,
    /// 创建时分配物理连续页并固定
    Contiguous,
    /// 页面已由外部映射，区域只负责接管
    AlreadyWired,
}

impl WiringMode {
    /// 创建后页面是否全部常驻
    pub fn is_wired(self) -> bool {
        matches!(self, Self::FullLock | Self::Contiguous | Self::AlreadyWired)
    }

    /// 简短名称，用于调试输出
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoLock => "none",
            Self::LazyLock => "lazy",
            Self::FullLock => "full",
            Self::Contiguous => "contig",
            Self::AlreadyWired => "wired",
        }
    }
}
