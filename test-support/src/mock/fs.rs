//! 后备文件的 Mock 实现
//!
//! `vm` crate 在 `cfg(test)` 下为 [`MockFile`] 实现 `BackingStore`。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

/// 错误码：读写失败时返回
pub const EIO: isize = -5;

/// 内存中的文件
///
/// 可选的“闸门”让读操作阻塞，直到测试调用 [`MockFile::open_gate`]，
/// 用于构造缺页读入期间的并发场景。
pub struct MockFile {
    data: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    gate: Option<(Mutex<bool>, Condvar)>,
    reading: AtomicUsize,
}

impl MockFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            gate: None,
            reading: AtomicUsize::new(0),
        }
    }

    /// 创建一个读操作会阻塞直到开闸的文件
    pub fn with_gate(data: Vec<u8>) -> Self {
        let mut file = Self::new(data);
        file.gate = Some((Mutex::new(false), Condvar::new()));
        file
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// 当前阻塞在闸门上的读操作数
    pub fn blocked_readers(&self) -> usize {
        self.reading.load(Ordering::SeqCst)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn open_gate(&self) {
        if let Some((open, cond)) = &self.gate {
            *open.lock().unwrap() = true;
            cond.notify_all();
        }
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some((open, cond)) = &self.gate {
            self.reading.fetch_add(1, Ordering::SeqCst);
            let mut opened = open.lock().unwrap();
            while !*opened {
                opened = cond.wait(opened).unwrap();
            }
            self.reading.fetch_sub(1, Ordering::SeqCst);
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(EIO);
        }
        let data = self.data.lock().unwrap();
        if offset >= data.len() {
            return Ok(0);
        }
        let len = buf.len().min(data.len() - offset);
        buf[..len].copy_from_slice(&data[offset..offset + len]);
        Ok(len)
    }

    /// 写回，不扩展文件长度
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, isize> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut data = self.data.lock().unwrap();
        if offset >= data.len() {
            return Ok(0);
        }
        let len = buf.len().min(data.len() - offset);
        data[offset..offset + len].copy_from_slice(&buf[..len]);
        Ok(len)
    }
}
