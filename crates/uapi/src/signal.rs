//! 信号编号（与 Linux 一致，仅包含 VM 会投递的信号）

/// 总线错误：映射存在但后备存储无法提供数据
pub const SIGBUS: u32 = 7;
/// 段错误：无映射或权限不足
pub const SIGSEGV: u32 = 11;
