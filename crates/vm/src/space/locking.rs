//! 地址空间加锁
//!
//! 守卫持有地址空间的 `Arc`，可以跨函数移动。多个地址空间必须按
//! [`SpaceId`] 升序加锁，由 [`MultiSpaceLocker`] 统一完成。

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::space::{AddressSpace, SpaceId, SpaceInner};

/// 已加锁的地址空间
///
/// 缓存链只能从实现了此 trait 的守卫构造。
pub trait SpaceLock {
    /// 地址空间句柄
    fn space(&self) -> &Arc<AddressSpace>;

    /// 受锁保护的状态
    fn inner(&self) -> &SpaceInner;
}

/// 读锁守卫
pub struct SpaceReadLocked {
    space: Arc<AddressSpace>,
}

impl SpaceReadLocked {
    pub(crate) fn lock(space: Arc<AddressSpace>) -> Self {
        core::mem::forget(space.state.read());
        Self { space }
    }
}

impl SpaceLock for SpaceReadLocked {
    fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    fn inner(&self) -> &SpaceInner {
        // Safety: 本对象存在期间读锁一直被占有
        unsafe { &*self.space.state.data_ptr() }
    }
}

impl Drop for SpaceReadLocked {
    fn drop(&mut self) {
        // Safety: lock() 中遗忘的读守卫由本对象代表
        unsafe { self.space.state.force_unlock_read() };
    }
}

/// 写锁守卫
pub struct SpaceWriteLocked {
    space: Arc<AddressSpace>,
}

impl SpaceWriteLocked {
    pub(crate) fn lock(space: Arc<AddressSpace>) -> Self {
        core::mem::forget(space.state.write());
        Self { space }
    }

    /// 受锁保护的状态（可变）
    pub(crate) fn inner_mut(&mut self) -> &mut SpaceInner {
        // Safety: 本对象存在期间写锁一直被占有，&mut self 保证独占
        unsafe { &mut *self.space.state.data_ptr() }
    }
}

impl SpaceLock for SpaceWriteLocked {
    fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    fn inner(&self) -> &SpaceInner {
        // Safety: 本对象存在期间写锁一直被占有
        unsafe { &*self.space.state.data_ptr() }
    }
}

impl Drop for SpaceWriteLocked {
    fn drop(&mut self) {
        // Safety: lock() 中遗忘的写守卫由本对象代表
        unsafe { self.space.state.force_unlock_write() };
    }
}

/// 同时写锁住多个地址空间
///
/// 先按编号排序去重，再依次加锁，避免两个跨空间操作互相等待。
pub(crate) struct MultiSpaceLocker {
    locked: Vec<SpaceWriteLocked>,
}

impl MultiSpaceLocker {
    pub(crate) fn lock(mut spaces: Vec<Arc<AddressSpace>>) -> Self {
        spaces.sort_by_key(|s| s.id());
        spaces.dedup_by_key(|s| s.id());
        Self {
            locked: spaces.into_iter().map(SpaceWriteLocked::lock).collect(),
        }
    }

    pub(crate) fn contains(&self, id: SpaceId) -> bool {
        self.locked.iter().any(|l| l.space().id() == id)
    }

    pub(crate) fn get(&self, id: SpaceId) -> Option<&SpaceWriteLocked> {
        self.locked.iter().find(|l| l.space().id() == id)
    }

    pub(crate) fn get_mut(&mut self, id: SpaceId) -> Option<&mut SpaceWriteLocked> {
        self.locked.iter_mut().find(|l| l.space().id() == id)
    }
}
