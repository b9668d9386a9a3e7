//! 平台相关操作的 Mock 实现
//!
//! 时钟使用 [`Instant`]，让出 CPU 使用 [`std::thread::yield_now`]，
//! 低内存通知与信号投递只做记录，供测试断言。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// 低内存通知回调
pub type LowResourceHook = Box<dyn Fn(usize) + Send + Sync>;

/// Mock 平台操作
pub struct MockPlatform {
    start: Instant,
    low_resource_calls: AtomicUsize,
    yields: AtomicUsize,
    signals: Mutex<Vec<(u32, usize)>>,
    fault_handler: Mutex<Option<usize>>,
    hook: Mutex<Option<LowResourceHook>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            low_resource_calls: AtomicUsize::new(0),
            yields: AtomicUsize::new(0),
            signals: Mutex::new(Vec::new()),
            fault_handler: Mutex::new(None),
            hook: Mutex::new(None),
        }
    }

    /// 自创建以来经过的时间
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn yield_now(&self) {
        self.yields.fetch_add(1, Ordering::Relaxed);
        std::thread::yield_now();
    }

    pub fn yield_count(&self) -> usize {
        self.yields.load(Ordering::Relaxed)
    }

    /// 记录一次低内存通知，并调用已注册的回调
    pub fn record_low_resource(&self, amount: usize) {
        self.low_resource_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(amount);
        }
    }

    pub fn low_resource_count(&self) -> usize {
        self.low_resource_calls.load(Ordering::Relaxed)
    }

    /// 注册低内存回调（模拟回收守护线程）
    pub fn set_low_resource_hook(&self, hook: LowResourceHook) {
        *self.hook.lock().unwrap() = Some(hook);
    }

    pub fn record_signal(&self, signal: u32, address: usize) {
        self.signals.lock().unwrap().push((signal, address));
    }

    /// 已投递的 (信号, 地址) 列表
    pub fn signals(&self) -> Vec<(u32, usize)> {
        self.signals.lock().unwrap().clone()
    }

    pub fn set_fault_handler(&self, handler: Option<usize>) {
        *self.fault_handler.lock().unwrap() = handler;
    }

    pub fn fault_handler(&self) -> Option<usize> {
        *self.fault_handler.lock().unwrap()
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}
