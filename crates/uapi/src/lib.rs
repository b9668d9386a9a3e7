//! 与用户空间共用定义和声明
//!
//! 包含区域保护位、地址放置方式、常驻策略与信号编号，
//! 确保内核和用户空间的一致性

#![no_std]

pub mod area;
pub mod signal;
