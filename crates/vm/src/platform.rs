//! 平台钩子
//!
//! 时钟、让出 CPU、低内存通知、信号投递和内核异常修复入口。
//! 由内核主体实现，作为 `Arc<dyn VmPlatform>` 交给 [`VirtualMemory`](crate::VirtualMemory)。

use core::time::Duration;

use uapi::signal::{SIGBUS, SIGSEGV};

/// 资源短缺的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowResource {
    /// 物理页
    Pages,
    /// 内存提交额度
    Memory,
}

/// 缺页失败时投递给用户线程的信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultSignal {
    /// 无映射或权限不足
    SegmentationFault,
    /// 后备存储无法提供数据
    BusError,
}

impl FaultSignal {
    /// 对应的信号编号
    pub fn signo(self) -> u32 {
        match self {
            FaultSignal::SegmentationFault => SIGSEGV,
            FaultSignal::BusError => SIGBUS,
        }
    }
}

/// 平台相关操作
pub trait VmPlatform: Send + Sync {
    /// 单调时钟
    fn now(&self) -> Duration;

    /// 让出 CPU，用于各等待循环
    fn yield_now(&self);

    /// 资源短缺通知，可以唤醒回收守护线程或同步回收缓存
    fn low_resource(&self, resource: LowResource, amount: usize);

    /// 向当前线程投递信号
    fn send_signal(&self, signal: FaultSignal, address: usize, pc: usize);

    /// 当前内核上下文登记的异常修复地址（如 copy_from_user 的修复入口）
    fn kernel_fault_handler(&self) -> Option<usize>;
}
