//! 后备存储接口

use crate::address::Ppn;

/// 缓存种类自定义缺页处理的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFault {
    /// 走通用的查找流程
    NotHandled,
    /// 直接映射给定物理页（如内存映射的设备寄存器），不进入缓存
    MapPhysical(Ppn),
}

/// 文件等后备存储
pub trait BackingStore: Send + Sync {
    /// 存储大小（字节）
    fn size(&self) -> usize;

    /// 偏移处是否有数据可读
    fn has_page(&self, offset: usize) -> bool {
        offset < self.size()
    }

    /// 读取，返回读到的字节数，不足部分由调用者补零
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize>;

    /// 写回
    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, isize>;

    /// 自定义缺页处理，默认走通用流程
    fn fault(&self, _offset: usize) -> StoreFault {
        StoreFault::NotHandled
    }
}
