// Unit tests for the vm crate.
//
// 协作者全部来自 `test-support`：带真实页内容的 MockPhysMem、按页表块计数的
// MockTranslationMap、记录信号的 MockPlatform 与可以阻塞读的 MockFile。
// 它们不依赖本 crate，trait 实现放在这里。

use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::time::Duration;

use test_support::mock::arch::MockPlatform;
use test_support::mock::fs::MockFile;
use test_support::mock::mm::{MockEntry, MockPhysMem, MockTranslationMap};

use crate::address::{PAGE_SIZE, Ppn};
use crate::area::AreaId;
use crate::cache::{BackingStore, StoreFault};
use crate::config::VmConfig;
use crate::error::VmError;
use crate::fault::FaultOutcome;
use crate::mapper::MappingKind;
use crate::page::{PageAllocator, PageReservation, PageState, ReserveMode};
use crate::platform::{FaultSignal, LowResource, VmPlatform};
use crate::space::{AddressSpace, SpaceId};
use crate::translation_map::{MappingInfo, PageFlags, TranslationMap, UnmappedPage};
use crate::virtual_memory::{AreaBacking, VirtualMemory};
use crate::{AddressSpec, AreaProtection, WiringMode};

impl PageAllocator for MockPhysMem {
    fn allocate_page(&self, state: PageState) -> Option<Ppn> {
        self.alloc(state as u8).map(Ppn)
    }

    fn allocate_contiguous_run(&self, state: PageState, hint: Option<Ppn>, count: usize) -> Option<Ppn> {
        self.alloc_contiguous(hint.map(Ppn::as_usize), count, state as u8)
            .map(Ppn)
    }

    fn free_page(&self, ppn: Ppn) {
        self.free(ppn.as_usize());
    }

    fn lookup_page(&self, ppn: Ppn) -> Option<PageState> {
        self.state(ppn.as_usize()).and_then(PageState::from_u8)
    }

    fn total_pages(&self) -> usize {
        self.total()
    }

    fn free_pages(&self) -> usize {
        self.free_count()
    }

    fn clear_page(&self, ppn: Ppn) {
        self.zero(ppn.as_usize());
    }

    fn copy_page(&self, from: Ppn, to: Ppn) {
        self.copy(from.as_usize(), to.as_usize());
    }

    fn read_page(&self, ppn: Ppn, offset: usize, buf: &mut [u8]) {
        self.read(ppn.as_usize(), offset, buf);
    }

    fn write_page(&self, ppn: Ppn, offset: usize, data: &[u8]) {
        self.write(ppn.as_usize(), offset, data);
    }
}

impl TranslationMap for MockTranslationMap {
    fn map(
        &mut self,
        address: usize,
        ppn: Ppn,
        protection: AreaProtection,
        reservation: &mut PageReservation,
    ) -> crate::error::VmResult<()> {
        if !self.has_table(address) {
            let table = reservation.take().ok_or(VmError::NoMemory)?;
            self.install_table(address, table.as_usize());
        }
        self.insert(
            address,
            MockEntry {
                pfn: ppn.as_usize(),
                protection: protection.bits(),
                flags: 0,
            },
        );
        Ok(())
    }

    fn unmap(&mut self, start: usize, end: usize) -> Vec<UnmappedPage> {
        self.remove_range(start, end)
            .into_iter()
            .map(|(address, entry)| UnmappedPage {
                address,
                ppn: Ppn(entry.pfn),
                flags: PageFlags::from_bits_truncate(entry.flags),
            })
            .collect()
    }

    fn protect(&mut self, start: usize, end: usize, protection: AreaProtection) {
        self.set_protection(start, end, protection.bits());
    }

    fn query(&self, address: usize) -> Option<MappingInfo> {
        self.get(address).map(|entry| MappingInfo {
            ppn: Ppn(entry.pfn),
            protection: AreaProtection::from_bits_truncate(entry.protection),
            flags: PageFlags::from_bits_truncate(entry.flags),
        })
    }

    fn clear_flags(&mut self, address: usize, flags: PageFlags) {
        MockTranslationMap::clear_flags(self, address, flags.bits());
    }

    fn max_pages_need(&self, start: usize, end: usize) -> usize {
        self.tables_needed(start, end)
    }

    fn mapped_size(&self) -> usize {
        self.len() * PAGE_SIZE
    }

    fn flush(&mut self) {
        MockTranslationMap::flush(self);
    }
}

impl VmPlatform for MockPlatform {
    fn now(&self) -> Duration {
        self.elapsed()
    }

    fn yield_now(&self) {
        MockPlatform::yield_now(self);
    }

    fn low_resource(&self, _resource: LowResource, amount: usize) {
        self.record_low_resource(amount);
    }

    fn send_signal(&self, signal: FaultSignal, address: usize, _pc: usize) {
        self.record_signal(signal.signo(), address);
    }

    fn kernel_fault_handler(&self) -> Option<usize> {
        self.fault_handler()
    }
}

impl BackingStore for MockFile {
    fn size(&self) -> usize {
        self.len()
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize> {
        MockFile::read_at(self, offset, buf)
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, isize> {
        MockFile::write_at(self, offset, buf)
    }
}

/// 测试用的 VM 上下文
struct TestVm {
    phys: Arc<MockPhysMem>,
    platform: Arc<MockPlatform>,
    vm: VirtualMemory,
}

impl TestVm {
    fn new(pages: usize) -> Self {
        let phys = Arc::new(MockPhysMem::new(pages));
        let platform = Arc::new(MockPlatform::new());
        let config = VmConfig {
            commit_timeout: Duration::from_millis(20),
            fault_memory_timeout: Duration::from_millis(20),
            ..VmConfig::default()
        };
        let vm = VirtualMemory::new(
            config,
            phys.clone(),
            platform.clone(),
            Box::new(MockTranslationMap::new(phys.clone())),
        );
        Self { phys, platform, vm }
    }

    /// 新建用户地址空间
    fn space(&self, team: u32) -> Arc<AddressSpace> {
        self.vm
            .create_address_space(SpaceId(team), Box::new(MockTranslationMap::new(self.phys.clone())))
            .unwrap()
    }

    /// 匿名可读写区域，返回 (编号, 起始地址)
    fn anon(&self, space: &Arc<AddressSpace>, pages: usize, wiring: WiringMode) -> (AreaId, usize) {
        let id = self
            .vm
            .create_area(
                space,
                "anon",
                AddressSpec::Any,
                pages * PAGE_SIZE,
                wiring,
                AreaProtection::READ | AreaProtection::WRITE,
                AreaBacking::Anonymous,
                0,
            )
            .unwrap();
        (id, self.base(id))
    }

    fn base(&self, id: AreaId) -> usize {
        self.vm.get_area_info(id).unwrap().base
    }

    fn write(&self, space: &Arc<AddressSpace>, address: usize, data: &[u8]) {
        self.vm.write_bytes_at(space, address, data, true).unwrap();
    }

    fn read(&self, space: &Arc<AddressSpace>, address: usize, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.vm.read_bytes_at(space, address, &mut buf, true).unwrap();
        buf
    }

    /// 用户读缺页
    fn touch(&self, space: &Arc<AddressSpace>, address: usize) -> FaultOutcome {
        self.vm.page_fault(Some(space), address, 0x1000, false, false, true)
    }

    fn query(&self, space: &Arc<AddressSpace>, address: usize) -> Option<MappingInfo> {
        space.map().lock().query(address)
    }
}

mod accountant;
mod area;
mod clone;
mod cow;
