//! VM 错误类型

use core::fmt;

/// VM 操作的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// 地址没有被任何区域覆盖
    BadAddress,
    /// 访问权限不足
    PermissionDenied,
    /// 参数无效（未对齐、大小为零、不支持的组合）
    InvalidArgs,
    /// 目标地址已被占用
    AddressInUse,
    /// 地址空间中找不到足够大的空闲范围
    NoVirtualSpace,
    /// 物理内存或提交额度不足
    NoMemory,
    /// 等待内存超时
    Timeout,
    /// 非阻塞请求无法立即满足
    WouldBlock,
    /// 操作对该区域或缓存不被允许
    NotAllowed,
    /// 范围内存在被锁定的内存
    Busy,
    /// 地址空间不存在或正在销毁
    BadSpace,
    /// 区域不存在
    BadArea,
    /// 后备存储 I/O 错误（携带存储返回的错误码）
    Io(isize),
}

/// VM 操作的结果
pub type VmResult<T> = Result<T, VmError>;

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::BadAddress => write!(f, "no mapping at address"),
            VmError::PermissionDenied => write!(f, "permission denied"),
            VmError::InvalidArgs => write!(f, "invalid arguments"),
            VmError::AddressInUse => write!(f, "address range in use"),
            VmError::NoVirtualSpace => write!(f, "address space full"),
            VmError::NoMemory => write!(f, "out of memory"),
            VmError::Timeout => write!(f, "memory reservation timed out"),
            VmError::WouldBlock => write!(f, "operation would block"),
            VmError::NotAllowed => write!(f, "operation not allowed"),
            VmError::Busy => write!(f, "range contains locked memory"),
            VmError::BadSpace => write!(f, "no such address space"),
            VmError::BadArea => write!(f, "no such area"),
            VmError::Io(code) => write!(f, "backing store I/O error {}", code),
        }
    }
}
