//! VM 配置
//!
//! 内存布局与记账策略的常量，构造 [`VirtualMemory`](crate::VirtualMemory) 时传入。

use core::time::Duration;

use uapi::area::AreaProtection;

/// VM 配置
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// 内核地址空间起始地址
    pub kernel_base: usize,
    /// 内核地址空间大小
    pub kernel_size: usize,
    /// 用户地址空间起始地址
    pub user_base: usize,
    /// 用户地址空间大小
    pub user_size: usize,
    /// 硬件支持的保护位
    pub supported_protection: AreaProtection,
    /// 显式调用（创建区域等）等待内存提交的最长时间
    pub commit_timeout: Duration,
    /// 缺页路径等待内存提交的最长时间
    pub fault_memory_timeout: Duration,
    /// 用户请求不能动用的保留量（字节）
    pub user_reserve: usize,
    /// 系统请求不能动用的保留量（字节）
    pub system_reserve: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            kernel_base: 0xffff_8000_0000_0000,
            kernel_size: 0x7fff_ffff_f000,
            user_base: 0x10_0000,
            user_size: 0x7fff_fff0_0000,
            supported_protection: AreaProtection::all(),
            commit_timeout: Duration::from_millis(1000),
            fault_memory_timeout: Duration::from_millis(5000),
            user_reserve: 0,
            system_reserve: 0,
        }
    }
}
