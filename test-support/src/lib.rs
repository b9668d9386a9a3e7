//! 测试支持 crate
//!
//! 提供 VM 协作者（物理页分配器、转换表、平台钩子、后备文件）的 Mock 实现。
//! 这些 Mock 只暴露固有方法，不依赖 `vm` crate；`vm` 在 `cfg(test)` 下
//! 为它们实现自己的 trait。

pub mod mock;
