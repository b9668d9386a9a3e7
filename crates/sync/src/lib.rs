//! 同步原语
//!
//! 向其它内核模块提供基本的锁原语：自旋锁与读写自旋锁。
//!
//! 锁的外层接口直接复用 [`lock_api`]，本 crate 只实现底层的原子状态机
//! （[`RawSpinLock`] 与 [`RawRwSpinLock`]），再通过类型别名暴露
//! [`SpinLock`] / [`RwLock`] 及其守卫类型。
//!
//! # 注意
//! 所有锁都不可重入。持有锁时再次获取同一把锁将导致死锁。

#![no_std]

#[cfg(test)]
extern crate std;

mod raw_spin_lock;
mod rwlock;
mod spin_lock;

pub use raw_spin_lock::RawSpinLock;
pub use rwlock::{RawRwSpinLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
