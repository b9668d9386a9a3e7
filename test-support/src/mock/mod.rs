//! Mock 实现模块
//!
//! 提供各种协作者的 Mock 实现，用于测试

pub mod arch;
pub mod fs;
pub mod mm;
