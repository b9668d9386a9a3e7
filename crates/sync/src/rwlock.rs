//! 读写自旋锁
//!
//! 状态字布局：
//! - bit 0 (`WRITER`)：写者持有锁
//! - bit 1 (`UPGRADING`)：有写者在排队，新的读者需让路
//! - 其余位：读者计数，每个读者加 `READER`
//!
//! 写者优先：写者排队期间新读者不能进入，避免写者饥饿。

use core::{
    hint,
    sync::atomic::{AtomicUsize, Ordering},
};

use lock_api::{GuardSend, RawRwLock};

const WRITER: usize = 1;
const UPGRADING: usize = 1 << 1;
const READER: usize = 1 << 2;

/// 读写自旋锁的底层实现。
#[derive(Debug)]
pub struct RawRwSpinLock {
    state: AtomicUsize,
}

impl RawRwSpinLock {
    /// 创建一个未加锁的实例。
    pub const fn new() -> Self {
        RawRwSpinLock {
            state: AtomicUsize::new(0),
        }
    }

    fn readers(&self) -> usize {
        self.state.load(Ordering::Relaxed) / READER
    }
}

impl Default for RawRwSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: 写者独占 WRITER 位且要求读者计数为零；读者只在没有写者
// 且没有写者排队时增加计数。
unsafe impl RawRwLock for RawRwSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawRwSpinLock::new();

    type GuardMarker = GuardSend;

    fn lock_shared(&self) {
        while !self.try_lock_shared() {
            hint::spin_loop();
        }
    }

    fn try_lock_shared(&self) -> bool {
        let state = self.state.load(Ordering::Relaxed);
        if state & (WRITER | UPGRADING) != 0 {
            return false;
        }
        self.state
            .compare_exchange_weak(state, state + READER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock_shared(&self) {
        debug_assert!(self.readers() > 0);
        self.state.fetch_sub(READER, Ordering::Release);
    }

    fn lock_exclusive(&self) {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & !UPGRADING == 0 {
                if self
                    .state
                    .compare_exchange_weak(state, WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            if state & UPGRADING == 0 {
                self.state.fetch_or(UPGRADING, Ordering::Relaxed);
            }
            hint::spin_loop();
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock_exclusive(&self) {
        debug_assert!(self.state.load(Ordering::Relaxed) & WRITER != 0);
        // 同时清除排队标志，仍在等待的写者会在下一轮重新设置
        self.state.fetch_and(!(WRITER | UPGRADING), Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & !UPGRADING != 0
    }

    fn is_locked_exclusive(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }
}

/// 读写自旋锁：多个读者或一个写者。
pub type RwLock<T> = lock_api::RwLock<RawRwSpinLock, T>;

/// [`RwLock`] 的读守卫。
pub type RwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawRwSpinLock, T>;

/// [`RwLock`] 的写守卫。
pub type RwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawRwSpinLock, T>;
