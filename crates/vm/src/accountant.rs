//! 内存提交记账
//!
//! 跟踪可提交的内存总量。每个缓存的提交（commitment）增减都必须对应
//! 一次 [`Accountant::reserve`] / [`Accountant::unreserve`]。
//!
//! 不变量：`0 <= available <= total`。

use alloc::sync::Arc;
use core::time::Duration;

use sync::SpinLock;

use crate::error::{VmError, VmResult};
use crate::platform::{LowResource, VmPlatform};

/// 申请者的优先级，决定可以动用多少保留量
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPriority {
    /// 用户态请求，不能动用用户保留量
    User,
    /// 内核请求，不能动用系统保留量
    System,
    /// 关键请求，可以用尽全部内存
    Vip,
}

/// 记账状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountSnapshot {
    /// 总量（字节）
    pub total: usize,
    /// 尚未提交（字节）
    pub available: usize,
    /// 正在等待的缺口（字节）
    pub needed: usize,
}

struct AccountState {
    total: usize,
    available: usize,
    needed: usize,
}

/// 内存记账器
pub struct Accountant {
    state: SpinLock<AccountState>,
    platform: Arc<dyn VmPlatform>,
    user_reserve: usize,
    system_reserve: usize,
}

impl Accountant {
    /// 创建记账器，初始时全部内存可用
    pub fn new(
        total: usize,
        user_reserve: usize,
        system_reserve: usize,
        platform: Arc<dyn VmPlatform>,
    ) -> Self {
        Self {
            state: SpinLock::new(AccountState {
                total,
                available: total,
                needed: 0,
            }),
            platform,
            user_reserve,
            system_reserve,
        }
    }

    fn floor(&self, priority: MemoryPriority) -> usize {
        match priority {
            MemoryPriority::User => self.user_reserve,
            MemoryPriority::System => self.system_reserve,
            MemoryPriority::Vip => 0,
        }
    }

    fn usable(state: &AccountState, floor: usize) -> usize {
        state.available.saturating_sub(floor)
    }

    /// 立即尝试提交，不足时返回 [`VmError::WouldBlock`]
    ///
    /// 用于持锁路径，不会触发低内存通知。
    pub fn try_reserve_non_blocking(&self, amount: usize, priority: MemoryPriority) -> VmResult<()> {
        let floor = self.floor(priority);
        let mut state = self.state.lock();
        if Self::usable(&state, floor) < amount {
            return Err(VmError::WouldBlock);
        }
        state.available -= amount;
        Ok(())
    }

    /// 提交 `amount` 字节，不足时阻塞等待至多 `timeout`
    ///
    /// 缺口记入 `needed` 并发出低内存通知，之后循环重新检查，
    /// 因为回收是异步发生的。`timeout` 为 [`Duration::MAX`] 时不会超时。
    pub fn reserve(&self, amount: usize, priority: MemoryPriority, timeout: Duration) -> VmResult<()> {
        if amount == 0 {
            return Ok(());
        }
        let floor = self.floor(priority);
        let deadline = self.platform.now().checked_add(timeout);
        let mut recorded = 0;
        loop {
            let missing = {
                let mut state = self.state.lock();
                let usable = Self::usable(&state, floor);
                if usable >= amount {
                    state.available -= amount;
                    state.needed -= recorded;
                    return Ok(());
                }
                let shortfall = amount - usable;
                state.needed = state.needed - recorded + shortfall;
                recorded = shortfall;
                state.needed
            };

            self.platform.low_resource(LowResource::Memory, missing);

            if deadline.is_some_and(|deadline| self.platform.now() >= deadline) {
                self.state.lock().needed -= recorded;
                log::warn!(
                    "accountant: reserving {} bytes timed out ({} bytes missing)",
                    amount,
                    recorded
                );
                return Err(VmError::Timeout);
            }
            self.platform.yield_now();
        }
    }

    /// 归还提交，从不阻塞
    pub fn unreserve(&self, amount: usize) {
        if amount == 0 {
            return;
        }
        let mut state = self.state.lock();
        debug_assert!(
            state.available + amount <= state.total,
            "accountant: unreserve of {} bytes exceeds total",
            amount
        );
        state.available = (state.available + amount).min(state.total);
    }

    /// 当前可用量（字节）
    pub fn available(&self) -> usize {
        self.state.lock().available
    }

    /// 当前等待中的缺口（字节）
    pub fn needed(&self) -> usize {
        self.state.lock().needed
    }

    /// 状态快照
    pub fn snapshot(&self) -> AccountSnapshot {
        let state = self.state.lock();
        AccountSnapshot {
            total: state.total,
            available: state.available,
            needed: state.needed,
        }
    }
}
