//! 内存管理协作者的 Mock 实现
//!
//! 注意：这里不直接依赖 `vm` crate（避免循环依赖）。
//! `vm` crate 在 `cfg(test)` 下为这些类型实现其 trait
//! （`PageAllocator` / `TranslationMap`）。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Mock 页大小
pub const MOCK_PAGE_SIZE: usize = 4096;

/// 第一个物理页帧号，避开 0 号页
pub const FIRST_PFN: usize = 0x100;

/// 一张页表覆盖的虚拟范围
pub const TABLE_SPAN: usize = 512 * MOCK_PAGE_SIZE;

/// 页帧状态：空闲
pub const STATE_FREE: u8 = 0;

struct Frame {
    state: u8,
    // 空 Vec 表示全零
    data: Vec<u8>,
}

/// Mock 物理内存
///
/// 管理 `pages` 个页帧，每个页帧带真实的字节内容，便于验证读写与写时复制。
pub struct MockPhysMem {
    frames: Mutex<Vec<Frame>>,
}

impl MockPhysMem {
    pub fn new(pages: usize) -> Self {
        let frames = (0..pages)
            .map(|_| Frame {
                state: STATE_FREE,
                data: Vec::new(),
            })
            .collect();
        Self {
            frames: Mutex::new(frames),
        }
    }

    fn index(pfn: usize, len: usize) -> Option<usize> {
        pfn.checked_sub(FIRST_PFN).filter(|idx| *idx < len)
    }

    pub fn total(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn free_count(&self) -> usize {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.state == STATE_FREE)
            .count()
    }

    pub fn used_count(&self) -> usize {
        self.total() - self.free_count()
    }

    /// 分配一个清零的页帧
    pub fn alloc(&self, state: u8) -> Option<usize> {
        assert_ne!(state, STATE_FREE);
        let mut frames = self.frames.lock().unwrap();
        let idx = frames.iter().position(|f| f.state == STATE_FREE)?;
        frames[idx].state = state;
        frames[idx].data.clear();
        Some(FIRST_PFN + idx)
    }

    /// 分配 `count` 个物理连续的清零页帧，从 `hint` 开始优先查找
    pub fn alloc_contiguous(&self, hint: Option<usize>, count: usize, state: u8) -> Option<usize> {
        assert_ne!(state, STATE_FREE);
        if count == 0 {
            return None;
        }
        let mut frames = self.frames.lock().unwrap();
        let len = frames.len();
        let start_idx = hint.and_then(|h| Self::index(h, len)).unwrap_or(0);
        let idx = (start_idx..len).chain(0..start_idx).find(|&idx| {
            idx + count <= len && frames[idx..idx + count].iter().all(|f| f.state == STATE_FREE)
        })?;
        for frame in &mut frames[idx..idx + count] {
            frame.state = state;
            frame.data.clear();
        }
        Some(FIRST_PFN + idx)
    }

    /// 释放页帧；重复释放视为测试错误
    pub fn free(&self, pfn: usize) {
        let mut frames = self.frames.lock().unwrap();
        let len = frames.len();
        let idx = Self::index(pfn, len).expect("free of unknown frame");
        assert_ne!(frames[idx].state, STATE_FREE, "double free of frame {:#x}", pfn);
        frames[idx].state = STATE_FREE;
        frames[idx].data = Vec::new();
    }

    /// 页帧状态；不属于本内存的页帧返回 None
    pub fn state(&self, pfn: usize) -> Option<u8> {
        let frames = self.frames.lock().unwrap();
        Self::index(pfn, frames.len()).map(|idx| frames[idx].state)
    }

    pub fn zero(&self, pfn: usize) {
        let mut frames = self.frames.lock().unwrap();
        let len = frames.len();
        if let Some(idx) = Self::index(pfn, len) {
            frames[idx].data.clear();
        }
    }

    pub fn copy(&self, from: usize, to: usize) {
        let mut frames = self.frames.lock().unwrap();
        let len = frames.len();
        if let (Some(src), Some(dst)) = (Self::index(from, len), Self::index(to, len)) {
            let data = frames[src].data.clone();
            frames[dst].data = data;
        }
    }

    pub fn read(&self, pfn: usize, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= MOCK_PAGE_SIZE);
        let frames = self.frames.lock().unwrap();
        let Some(idx) = Self::index(pfn, frames.len()) else {
            buf.fill(0);
            return;
        };
        let data = &frames[idx].data;
        if data.is_empty() {
            buf.fill(0);
        } else {
            buf.copy_from_slice(&data[offset..offset + buf.len()]);
        }
    }

    pub fn write(&self, pfn: usize, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= MOCK_PAGE_SIZE);
        let mut frames = self.frames.lock().unwrap();
        let len = frames.len();
        if let Some(idx) = Self::index(pfn, len) {
            let data = &mut frames[idx].data;
            if data.is_empty() {
                data.resize(MOCK_PAGE_SIZE, 0);
            }
            data[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
    }
}

/// 一条 Mock 页表项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockEntry {
    pub pfn: usize,
    pub protection: u32,
    pub flags: u32,
}

/// Mock 转换表
///
/// 用有序表记录虚拟页到页帧的映射。每 [`TABLE_SPAN`] 字节的虚拟范围
/// 需要一张页表，页表页从 [`MockPhysMem`] 借出，转换表销毁时归还。
pub struct MockTranslationMap {
    phys: Arc<MockPhysMem>,
    entries: BTreeMap<usize, MockEntry>,
    tables: BTreeMap<usize, usize>,
}

impl MockTranslationMap {
    pub fn new(phys: Arc<MockPhysMem>) -> Self {
        Self {
            phys,
            entries: BTreeMap::new(),
            tables: BTreeMap::new(),
        }
    }

    /// 映射 `[start, end)` 最多还需要多少张页表
    pub fn tables_needed(&self, start: usize, end: usize) -> usize {
        if start >= end {
            return 0;
        }
        (start / TABLE_SPAN..=(end - 1) / TABLE_SPAN)
            .filter(|chunk| !self.tables.contains_key(chunk))
            .count()
    }

    pub fn has_table(&self, va: usize) -> bool {
        self.tables.contains_key(&(va / TABLE_SPAN))
    }

    pub fn install_table(&mut self, va: usize, pfn: usize) {
        let previous = self.tables.insert(va / TABLE_SPAN, pfn);
        assert!(previous.is_none(), "page table installed twice");
    }

    /// 写入页表项，返回被覆盖的旧项
    pub fn insert(&mut self, va: usize, entry: MockEntry) -> Option<MockEntry> {
        assert!(self.has_table(va), "mapping without page table at {:#x}", va);
        self.entries.insert(va, entry)
    }

    pub fn remove_range(&mut self, start: usize, end: usize) -> Vec<(usize, MockEntry)> {
        let keys: Vec<usize> = self.entries.range(start..end).map(|(va, _)| *va).collect();
        keys.into_iter()
            .filter_map(|va| self.entries.remove(&va).map(|entry| (va, entry)))
            .collect()
    }

    pub fn set_protection(&mut self, start: usize, end: usize, protection: u32) {
        for (_, entry) in self.entries.range_mut(start..end) {
            entry.protection = protection;
        }
    }

    pub fn get(&self, va: usize) -> Option<MockEntry> {
        self.entries.get(&va).copied()
    }

    pub fn clear_flags(&mut self, va: usize, flags: u32) {
        if let Some(entry) = self.entries.get_mut(&va) {
            entry.flags &= !flags;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn flush(&mut self) {}
}

impl Drop for MockTranslationMap {
    fn drop(&mut self) {
        for (_, pfn) in core::mem::take(&mut self.tables) {
            self.phys.free(pfn);
        }
    }
}
