use super::*;

#[test]
fn test_areas_are_page_aligned_and_disjoint() {
    let t = TestVm::new(64);
    let space = t.space(1);

    for pages in [1, 3, 2, 5] {
        t.anon(&space, pages, WiringMode::NoLock);
    }

    let ranges = space.area_ranges();
    assert_eq!(ranges.len(), 4);
    for (_, base, size) in &ranges {
        assert_eq!(base % PAGE_SIZE, 0);
        assert_eq!(size % PAGE_SIZE, 0);
        assert!(*base >= space.base() && base + size <= space.end());
    }
    for pair in ranges.windows(2) {
        assert!(pair[0].1 + pair[0].2 <= pair[1].1);
    }
}

#[test]
fn test_create_rejects_bad_arguments() {
    let t = TestVm::new(16);
    let space = t.space(1);
    let rw = AreaProtection::READ | AreaProtection::WRITE;

    let create = |spec, size, wiring, backing| {
        t.vm.create_area(&space, "bad", spec, size, wiring, rw, backing, 0)
    };
    assert_eq!(
        create(AddressSpec::Any, PAGE_SIZE + 1, WiringMode::NoLock, AreaBacking::Anonymous),
        Err(VmError::InvalidArgs)
    );
    assert_eq!(
        create(AddressSpec::Any, 0, WiringMode::NoLock, AreaBacking::Anonymous),
        Err(VmError::InvalidArgs)
    );
    assert_eq!(
        create(AddressSpec::Exact(space.base() + 1), PAGE_SIZE, WiringMode::NoLock, AreaBacking::Anonymous),
        Err(VmError::InvalidArgs)
    );
    assert_eq!(
        create(AddressSpec::Any, PAGE_SIZE, WiringMode::FullLock, AreaBacking::Null),
        Err(VmError::InvalidArgs)
    );
    assert_eq!(
        create(AddressSpec::Any, PAGE_SIZE, WiringMode::AlreadyWired, AreaBacking::Anonymous),
        Err(VmError::NotAllowed)
    );
    assert_eq!(space.area_count(), 0);
}

#[test]
fn test_exact_placement_conflict() {
    let t = TestVm::new(16);
    let space = t.space(1);
    let base = space.base() + 0x10_0000;
    let rw = AreaProtection::READ | AreaProtection::WRITE;

    t.vm.create_area(&space, "a", AddressSpec::Exact(base), 4 * PAGE_SIZE, WiringMode::NoLock, rw, AreaBacking::Anonymous, 0)
        .unwrap();
    let result = t.vm.create_area(
        &space,
        "b",
        AddressSpec::Exact(base + PAGE_SIZE),
        PAGE_SIZE,
        WiringMode::NoLock,
        rw,
        AreaBacking::Anonymous,
        0,
    );
    assert_eq!(result, Err(VmError::AddressInUse));
    assert_eq!(space.area_count(), 1);
}

#[test]
fn test_base_placement_falls_back_to_bottom() {
    let t = TestVm::new(16);
    let space = t.space(1);
    let rw = AreaProtection::READ | AreaProtection::WRITE;

    let hint = space.base() + 0x20_0000;
    let a = t
        .vm
        .create_area(&space, "a", AddressSpec::Base(hint), PAGE_SIZE, WiringMode::NoLock, rw, AreaBacking::Anonymous, 0)
        .unwrap();
    assert_eq!(t.base(a), hint);

    // 提示地址之后放不下，从空间起点重新找
    let b = t
        .vm
        .create_area(
            &space,
            "b",
            AddressSpec::Base(space.end() - PAGE_SIZE),
            2 * PAGE_SIZE,
            WiringMode::NoLock,
            rw,
            AreaBacking::Anonymous,
            0,
        )
        .unwrap();
    assert_eq!(t.base(b), space.base());
}

#[test]
fn test_first_fit_fills_gaps_around_areas_and_reservations() {
    let t = TestVm::new(16);
    let space = t.space(1);
    let rw = AreaProtection::READ | AreaProtection::WRITE;
    let start = space.base();

    t.anon(&space, 2, WiringMode::NoLock);
    let (hole, hole_base) = t.anon(&space, 1, WiringMode::NoLock);
    t.anon(&space, 2, WiringMode::NoLock);
    assert_eq!(hole_base, start + 2 * PAGE_SIZE);
    t.vm.delete_area(&space, hole).unwrap();
    t.vm.reserve_address_range(&space, AddressSpec::Exact(start + 5 * PAGE_SIZE), 2 * PAGE_SIZE)
        .unwrap();

    let (_, small) = t.anon(&space, 1, WiringMode::NoLock);
    assert_eq!(small, start + 2 * PAGE_SIZE);
    // 保留范围之后才有两页的空位
    let (_, large) = t.anon(&space, 2, WiringMode::NoLock);
    assert_eq!(large, start + 7 * PAGE_SIZE);
    let hinted = t
        .vm
        .create_area(&space, "hint", AddressSpec::Base(start), PAGE_SIZE, WiringMode::NoLock, rw, AreaBacking::Anonymous, 0)
        .unwrap();
    assert_eq!(t.base(hinted), start + 9 * PAGE_SIZE);

    // 精确放置可以落进保留范围
    let exact = t
        .vm
        .create_area(
            &space,
            "exact",
            AddressSpec::Exact(start + 6 * PAGE_SIZE),
            PAGE_SIZE,
            WiringMode::NoLock,
            rw,
            AreaBacking::Anonymous,
            0,
        )
        .unwrap();
    assert_eq!(t.base(exact), start + 6 * PAGE_SIZE);
    assert_eq!(
        t.vm.create_area(
            &space,
            "clash",
            AddressSpec::Exact(start + 8 * PAGE_SIZE),
            PAGE_SIZE,
            WiringMode::NoLock,
            rw,
            AreaBacking::Anonymous,
            0,
        ),
        Err(VmError::AddressInUse)
    );
}

#[test]
fn test_write_then_read_back() {
    let t = TestVm::new(32);
    let space = t.space(1);
    let (_, base) = t.anon(&space, 4, WiringMode::NoLock);

    for page in 0..4u8 {
        t.write(&space, base + page as usize * PAGE_SIZE + 8, &[page + 1; 32]);
    }
    for page in 0..4u8 {
        let data = t.read(&space, base + page as usize * PAGE_SIZE + 8, 32);
        assert_eq!(data, vec![page + 1; 32]);
    }
    // 未写过的字节为零
    assert_eq!(t.read(&space, base, 8), vec![0u8; 8]);

    assert_eq!(space.fault_count(), 4);
    assert_eq!(t.vm.stats().snapshot().zero_fill, 4);
    assert_eq!(space.mapped_size(), 4 * PAGE_SIZE);
}

#[test]
fn test_access_crossing_page_boundary() {
    let t = TestVm::new(32);
    let space = t.space(1);
    let (_, base) = t.anon(&space, 2, WiringMode::NoLock);

    let data: Vec<u8> = (0..64u8).collect();
    t.write(&space, base + PAGE_SIZE - 32, &data);
    assert_eq!(t.read(&space, base + PAGE_SIZE - 32, 64), data);
    assert_eq!(space.fault_count(), 2);
}

#[test]
fn test_delete_area_releases_everything() {
    let t = TestVm::new(32);
    let space = t.space(1);

    // 第一次映射会装上页表，之后的比较不受影响
    let (warmup, base) = t.anon(&space, 4, WiringMode::NoLock);
    t.write(&space, base, &[1; 16]);
    t.vm.delete_area(&space, warmup).unwrap();

    let free = t.phys.free_count();
    let available = t.vm.accountant().available();

    let (id, base) = t.anon(&space, 4, WiringMode::NoLock);
    for page in 0..4 {
        t.write(&space, base + page * PAGE_SIZE, &[7; 16]);
    }
    let cache = Arc::downgrade(&t.vm.area_cache(id).unwrap());
    assert_eq!(t.phys.free_count(), free - 4);

    t.vm.delete_area(&space, id).unwrap();
    assert!(cache.upgrade().is_none());
    assert_eq!(t.phys.free_count(), free);
    assert_eq!(t.vm.accountant().available(), available);
    assert!(t.vm.mapping_table().is_empty());
    assert_eq!(space.mapped_size(), 0);
    assert_eq!(t.vm.area_for(&space, base), None);
    assert_eq!(t.vm.get_area_info(id).unwrap_err(), VmError::BadArea);
    assert_eq!(t.vm.delete_area(&space, id), Err(VmError::BadArea));
}

#[test]
fn test_full_lock_area_is_populated_and_wired() {
    let t = TestVm::new(32);
    let space = t.space(1);
    let used = t.phys.used_count();

    let (id, base) = t.anon(&space, 3, WiringMode::FullLock);

    // 三个数据页加一张页表
    assert_eq!(t.phys.used_count() - used, 4);
    let cache = t.vm.area_cache(id).unwrap();
    assert_eq!(cache.page_count(), 3);
    for page in 0..3 {
        let (ppn, wired) = cache.page_at(page * PAGE_SIZE).unwrap();
        assert_eq!(wired, 1);
        assert_eq!(t.query(&space, base + page * PAGE_SIZE).unwrap().ppn, ppn);
        assert_eq!(t.vm.mapping_table().mapping_count(ppn), 1);
    }

    for page in 0..3 {
        t.write(&space, base + page * PAGE_SIZE, &[9; 8]);
    }
    assert_eq!(space.fault_count(), 0);
    assert_eq!(
        t.vm.accountant().available(),
        32 * PAGE_SIZE - 3 * PAGE_SIZE
    );
}

#[test]
fn test_contiguous_area_is_one_physical_run() {
    let t = TestVm::new(32);
    let space = t.space(1);
    let (_, base) = t.anon(&space, 4, WiringMode::Contiguous);

    let runs = t.vm.get_memory_map(&space, base, 4 * PAGE_SIZE).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].size, 4 * PAGE_SIZE);
    assert_eq!(space.fault_count(), 0);
}

#[test]
fn test_null_area_faults_fail() {
    let t = TestVm::new(16);
    let space = t.space(1);
    let id = t
        .vm
        .create_area(&space, "guard", AddressSpec::Any, 2 * PAGE_SIZE, WiringMode::NoLock, AreaProtection::READ, AreaBacking::Null, 0)
        .unwrap();
    let base = t.base(id);

    let outcome = t.touch(&space, base + PAGE_SIZE);
    assert_eq!(
        outcome,
        FaultOutcome::Signal {
            signal: FaultSignal::SegmentationFault,
            address: base + PAGE_SIZE
        }
    );
    assert_eq!(t.platform.signals(), vec![(FaultSignal::SegmentationFault.signo(), base + PAGE_SIZE)]);
    assert_eq!(t.vm.area_cache(id).unwrap().page_count(), 0);
}

#[test]
fn test_physical_area_is_mapped_eagerly() {
    let t = TestVm::new(16);
    let space = t.space(1);
    let id = t
        .vm
        .create_area(
            &space,
            "mmio",
            AddressSpec::Any,
            2 * PAGE_SIZE,
            WiringMode::NoLock,
            AreaProtection::READ | AreaProtection::WRITE,
            AreaBacking::Physical(Ppn(0x9000)),
            0,
        )
        .unwrap();
    let base = t.base(id);

    assert_eq!(t.query(&space, base).unwrap().ppn, Ppn(0x9000));
    assert_eq!(t.query(&space, base + PAGE_SIZE).unwrap().ppn, Ppn(0x9001));
    // 设备页不进反向映射表
    assert!(t.vm.mapping_table().is_empty());
    assert_eq!(t.touch(&space, base), FaultOutcome::Resolved);
    assert_eq!(t.vm.area_cache(id).unwrap().page_count(), 0);
}

#[test]
fn test_already_wired_area_adopts_existing_mappings() {
    let t = TestVm::new(16);
    let kernel = t.vm.kernel_address_space();
    let base = kernel.base();

    let ppn = Ppn(t.phys.alloc(PageState::Wired as u8).unwrap());
    {
        let mut reservation =
            PageReservation::reserve(t.phys.clone(), &*t.platform, 1, ReserveMode::NoWait).unwrap();
        kernel
            .map()
            .lock()
            .map(base, ppn, AreaProtection::KERNEL_READ | AreaProtection::KERNEL_WRITE, &mut reservation)
            .unwrap();
    }

    let id = t
        .vm
        .create_area(
            &kernel,
            "boot",
            AddressSpec::Exact(base),
            2 * PAGE_SIZE,
            WiringMode::AlreadyWired,
            AreaProtection::KERNEL_READ | AreaProtection::KERNEL_WRITE,
            AreaBacking::Anonymous,
            0,
        )
        .unwrap();

    let cache = t.vm.area_cache(id).unwrap();
    assert_eq!(cache.page_at(0), Some((ppn, 1)));
    assert_eq!(cache.page_at(PAGE_SIZE), None);
    assert_eq!(t.vm.mapping_table().mapping_count(ppn), 1);
}

#[test]
fn test_address_space_lifecycle() {
    let t = TestVm::new(32);
    let free = t.phys.free_count();
    let space = t.space(7);

    let duplicate = t
        .vm
        .create_address_space(SpaceId(7), Box::new(MockTranslationMap::new(t.phys.clone())));
    assert_eq!(duplicate.unwrap_err(), VmError::InvalidArgs);
    assert!(t.vm.address_space(SpaceId(7)).is_some());

    let (_, base) = t.anon(&space, 2, WiringMode::NoLock);
    let (_, wired) = t.anon(&space, 2, WiringMode::FullLock);
    t.write(&space, base, &[3; 8]);
    t.write(&space, wired, &[4; 8]);

    t.vm.destroy_address_space(&space).unwrap();
    assert!(space.is_deleting());
    assert!(t.vm.address_space(SpaceId(7)).is_none());
    assert_eq!(space.area_count(), 0);
    assert!(t.vm.mapping_table().is_empty());
    assert_eq!(t.vm.accountant().available(), 32 * PAGE_SIZE);

    let late = t.vm.create_area(
        &space,
        "late",
        AddressSpec::Any,
        PAGE_SIZE,
        WiringMode::NoLock,
        AreaProtection::READ,
        AreaBacking::Anonymous,
        0,
    );
    assert_eq!(late, Err(VmError::BadSpace));

    // 页表随最后一个句柄释放
    drop(space);
    assert_eq!(t.phys.free_count(), free);

    let kernel = t.vm.kernel_address_space();
    assert_eq!(t.vm.destroy_address_space(&kernel), Err(VmError::NotAllowed));
}

#[test]
fn test_reserved_range_only_admits_exact_placement() {
    let t = TestVm::new(16);
    let space = t.space(1);
    let rw = AreaProtection::READ | AreaProtection::WRITE;

    let reserved = t.vm.reserve_address_range(&space, AddressSpec::Any, 8 * PAGE_SIZE).unwrap();
    assert_eq!(reserved, space.base());

    let (_, any) = t.anon(&space, 2, WiringMode::NoLock);
    assert_eq!(any, reserved + 8 * PAGE_SIZE);

    t.vm.create_area(&space, "exact", AddressSpec::Exact(reserved), 2 * PAGE_SIZE, WiringMode::NoLock, rw, AreaBacking::Anonymous, 0)
        .unwrap();
    let remaining = space.reserved_ranges();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].base, reserved + 2 * PAGE_SIZE);
    assert_eq!(remaining[0].size, 6 * PAGE_SIZE);

    assert_eq!(
        t.vm.reserve_address_range(&space, AddressSpec::Exact(reserved + 2 * PAGE_SIZE), PAGE_SIZE),
        Err(VmError::AddressInUse)
    );

    t.vm.unreserve_address_range(&space, reserved, 8 * PAGE_SIZE).unwrap();
    assert!(space.reserved_ranges().is_empty());
}

#[test]
fn test_area_info() {
    let t = TestVm::new(16);
    let space = t.space(1);
    let (id, base) = t.anon(&space, 4, WiringMode::LazyLock);
    t.write(&space, base + PAGE_SIZE, &[1; 4]);

    let info = t.vm.get_area_info(id).unwrap();
    assert_eq!(info.name, "anon");
    assert_eq!(info.space, SpaceId(1));
    assert_eq!(info.size, 4 * PAGE_SIZE);
    assert_eq!(info.wiring, WiringMode::LazyLock);
    assert_eq!(info.ram_size, PAGE_SIZE);
    assert_eq!(info.copy_depth, 0);
    assert!(info.protection.contains(AreaProtection::KERNEL_WRITE));
    assert_eq!(t.vm.area_for(&space, base + 3 * PAGE_SIZE), Some(id));
    assert_eq!(t.vm.area_for(&space, base + 4 * PAGE_SIZE), None);
}
