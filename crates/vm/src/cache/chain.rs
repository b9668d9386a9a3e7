//! 缓存链加锁
//!
//! [`CacheChain`] 只能由已加锁的地址空间构造，从区域的顶层缓存开始，
//! 通过 [`CacheChain::lock_parent`] 逐层向下扩展。锁总是自顶向下获取、
//! 自顶向下释放，全部解锁之后才放开各层句柄。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::marker::PhantomData;

use crate::cache::{Cache, LockedCache};
use crate::space::SpaceLock;

/// 自顶向下加锁的缓存链
pub(crate) struct CacheChain<'s> {
    caches: Vec<LockedCache>,
    _space: PhantomData<&'s ()>,
}

impl<'s> CacheChain<'s> {
    /// 锁住区域的顶层缓存
    pub(crate) fn lock_top<L: SpaceLock + ?Sized>(_space: &'s L, top: Arc<Cache>) -> Self {
        Self {
            caches: alloc::vec![LockedCache::lock(top)],
            _space: PhantomData,
        }
    }

    /// 锁住当前最底层缓存的父缓存；没有父缓存时返回 false
    pub(crate) fn lock_parent(&mut self) -> bool {
        let Some(source) = self.bottom().source().cloned() else {
            return false;
        };
        self.caches.push(LockedCache::lock(source));
        true
    }

    /// 已锁住的层数
    pub(crate) fn len(&self) -> usize {
        self.caches.len()
    }

    /// 顶层缓存
    pub(crate) fn top(&self) -> &LockedCache {
        &self.caches[0]
    }

    /// 顶层缓存（可变）
    pub(crate) fn top_mut(&mut self) -> &mut LockedCache {
        &mut self.caches[0]
    }

    /// 当前最底层缓存
    pub(crate) fn bottom(&self) -> &LockedCache {
        &self.caches[self.caches.len() - 1]
    }

    /// 第 `level` 层
    pub(crate) fn get(&self, level: usize) -> &LockedCache {
        &self.caches[level]
    }

    /// 第 `level` 层（可变）
    pub(crate) fn get_mut(&mut self, level: usize) -> &mut LockedCache {
        &mut self.caches[level]
    }
}

impl Drop for CacheChain<'_> {
    fn drop(&mut self) {
        let handles: Vec<Arc<Cache>> = self.caches.drain(..).map(LockedCache::unlock).collect();
        drop(handles);
    }
}
