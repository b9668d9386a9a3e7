//! 虚拟内存核心
//!
//! 负责决定“什么映射在哪里、缺页如何解决”的可移植策略层：
//! 地址空间与区域、缓存链与写时复制、软缺页解析以及内存提交记账。
//!
//! # 架构解耦
//!
//! 通过 trait 与外部协作者解耦，全部在构造 [`VirtualMemory`] 时传入，
//! 不存在全局注册表：
//! - [`PageAllocator`]: 物理页分配器
//! - [`TranslationMap`]: 硬件页表驱动（每个地址空间一个）
//! - [`VmPlatform`]: 时钟、让出 CPU、低内存通知、信号投递
//! - [`BackingStore`]: 文件等后备存储
//!
//! # 锁顺序
//!
//! 地址空间（按 [`SpaceId`] 升序）→ 缓存（自顶向下沿 source 链）→
//! 转换表 → 全局反向映射表。缓存链只能自顶向下逐层加锁。

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

mod accountant;
mod area;
mod config;
mod error;
mod fault;
mod mapper;
mod mapping_table;
mod platform;
mod translation_map;
mod virtual_memory;

pub mod address;
pub mod cache;
pub mod debug;
pub mod page;
pub mod space;

#[cfg(test)]
mod tests;

pub use accountant::{AccountSnapshot, Accountant, MemoryPriority};
pub use address::{PAGE_SHIFT, PAGE_SIZE, Ppn};
pub use area::{Area, AreaId, AreaInfo};
pub use cache::{BackingStore, Cache, CacheId, CacheKind, CacheKindTag, StoreFault};
pub use config::VmConfig;
pub use error::{VmError, VmResult};
pub use fault::{FaultOutcome, FaultStats, FaultStatsSnapshot};
pub use mapper::MappingKind;
pub use mapping_table::{MappingTable, PageMapping};
pub use page::{ContiguousRun, PageAllocator, PageReservation, PageState, ReserveMode, VmPage};
pub use platform::{FaultSignal, LowResource, VmPlatform};
pub use space::{AddressSpace, SpaceId};
pub use translation_map::{MappingInfo, PageFlags, TranslationMap, UnmappedPage};
pub use virtual_memory::{AreaBacking, KERNEL_SPACE_ID, PhysicalRun, VirtualMemory};

pub use uapi::area::{AddressSpec, AreaProtection, WiringMode};
