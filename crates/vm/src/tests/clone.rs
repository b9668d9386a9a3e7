use super::*;

fn shared_clone(
    t: &TestVm,
    target: &Arc<AddressSpace>,
    source: AreaId,
    protection: AreaProtection,
) -> Result<AreaId, VmError> {
    t.vm
        .clone_area(target, "shared", AddressSpec::Any, protection, MappingKind::Shared, source)
}

#[test]
fn test_shared_clone_sees_writes_both_ways() {
    let t = TestVm::new(32);
    let space = t.space(1);
    let other = t.space(2);
    let (a, a_base) = t.anon(&space, 2, WiringMode::NoLock);
    t.write(&space, a_base, b"from a");

    let b = shared_clone(&t, &other, a, AreaProtection::READ | AreaProtection::WRITE).unwrap();
    let b_base = t.base(b);
    assert_eq!(t.read(&other, b_base, 6), b"from a".to_vec());

    t.write(&other, b_base + PAGE_SIZE, b"from b");
    assert_eq!(t.read(&space, a_base + PAGE_SIZE, 6), b"from b".to_vec());

    let cache = t.vm.area_cache(a).unwrap();
    assert_eq!(t.vm.area_cache(b).unwrap().id(), cache.id());
    assert_eq!(cache.info().area_count, 2);
    assert_eq!(cache.page_count(), 2);
    assert_eq!(t.vm.get_area_info(b).unwrap().copy_depth, 0);
}

#[test]
fn test_writable_shared_clone_of_cow_source_is_refused() {
    let t = TestVm::new(32);
    let space = t.space(1);
    let other = t.space(2);
    let (a, _) = t.anon(&space, 1, WiringMode::NoLock);
    // 只读的源不会被提升，私有层直接挂在它的缓存上
    t.vm.set_area_protection(a, AreaProtection::READ).unwrap();
    t.vm
        .clone_area(
            &space,
            "private",
            AddressSpec::Any,
            AreaProtection::READ,
            MappingKind::Private,
            a,
        )
        .unwrap();

    assert_eq!(
        shared_clone(&t, &other, a, AreaProtection::READ | AreaProtection::WRITE),
        Err(VmError::NotAllowed)
    );
    assert_eq!(other.area_count(), 0);
    // 只读的共享绑定仍然可以
    shared_clone(&t, &other, a, AreaProtection::READ).unwrap();
}

#[test]
fn test_shared_clone_maps_wired_pages_eagerly() {
    let t = TestVm::new(32);
    let space = t.space(1);
    let other = t.space(2);
    let (a, a_base) = t.anon(&space, 2, WiringMode::FullLock);
    t.write(&space, a_base, &[9; 4]);

    let b = shared_clone(&t, &other, a, AreaProtection::READ).unwrap();
    let b_base = t.base(b);
    let source = t.query(&space, a_base).unwrap();
    let mapped = t.query(&other, b_base).unwrap();
    assert_eq!(mapped.ppn, source.ppn);
    assert!(t.query(&other, b_base + PAGE_SIZE).is_some());
    assert_eq!(t.vm.mapping_table().mapping_count(source.ppn), 2);
    assert_eq!(other.fault_count(), 0);
}

#[test]
fn test_clone_into_reserved_range() {
    let t = TestVm::new(32);
    let space = t.space(1);
    let other = t.space(2);
    let (a, _) = t.anon(&space, 2, WiringMode::NoLock);
    let reserved = t
        .vm
        .reserve_address_range(&other, AddressSpec::Any, 4 * PAGE_SIZE)
        .unwrap();

    // 非精确放置避开保留范围
    let b = shared_clone(&t, &other, a, AreaProtection::READ).unwrap();
    assert!(t.base(b) >= reserved + 4 * PAGE_SIZE);

    let c = t
        .vm
        .clone_area(
            &other,
            "exact",
            AddressSpec::Exact(reserved),
            AreaProtection::READ,
            MappingKind::Shared,
            a,
        )
        .unwrap();
    assert_eq!(t.base(c), reserved);
    let left = other.reserved_ranges();
    assert_eq!(left.len(), 1);
    assert_eq!((left[0].base, left[0].size), (reserved + 2 * PAGE_SIZE, 2 * PAGE_SIZE));
}

#[test]
fn test_transfer_area_moves_to_target() {
    let t = TestVm::new(32);
    let space = t.space(1);
    let other = t.space(2);
    let (a, a_base) = t.anon(&space, 2, WiringMode::NoLock);
    t.write(&space, a_base + PAGE_SIZE, b"moved");
    let cache = t.vm.area_cache(a).unwrap();

    let moved = t.vm.transfer_area(a, &other, AddressSpec::Any).unwrap();
    assert_ne!(moved, a);
    assert_eq!(t.vm.get_area_info(a).unwrap_err(), VmError::BadArea);
    assert_eq!(space.area_count(), 0);
    assert!(t.query(&space, a_base + PAGE_SIZE).is_none());

    let info = t.vm.get_area_info(moved).unwrap();
    assert_eq!(info.space, other.id());
    assert_eq!(info.cache, cache.id());
    assert_eq!(t.read(&other, info.base + PAGE_SIZE, 5), b"moved".to_vec());
    assert_eq!(cache.info().area_count, 1);
}

#[test]
fn test_transfer_of_wired_area_remaps_it() {
    let t = TestVm::new(32);
    let space = t.space(1);
    let other = t.space(2);
    let (a, a_base) = t.anon(&space, 2, WiringMode::FullLock);
    let ppn = t.query(&space, a_base).unwrap().ppn;

    let moved = t.vm.transfer_area(a, &other, AddressSpec::Any).unwrap();
    let base = t.base(moved);
    assert_eq!(t.query(&other, base).unwrap().ppn, ppn);

    let cache = t.vm.area_cache(moved).unwrap();
    assert_eq!(cache.page_at(0), Some((ppn, 1)));
    let mappings = t.vm.mapping_table().mappings_of(ppn);
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].space, other.id());
    assert_eq!(other.fault_count(), 0);
}

#[test]
fn test_transfer_with_locked_memory_is_busy() {
    let t = TestVm::new(32);
    let space = t.space(1);
    let other = t.space(2);
    let (a, a_base) = t.anon(&space, 2, WiringMode::NoLock);
    t.vm.lock_memory(&space, a_base, PAGE_SIZE, false).unwrap();

    assert_eq!(t.vm.transfer_area(a, &other, AddressSpec::Any), Err(VmError::Busy));
    assert_eq!(t.vm.get_area_info(a).unwrap().space, space.id());

    t.vm.unlock_memory(&space, a_base, PAGE_SIZE).unwrap();
    t.vm.transfer_area(a, &other, AddressSpec::Any).unwrap();
}

#[test]
fn test_shared_clone_waits_for_page_table_memory() {
    let t = TestVm::new(16);
    let space = t.space(1);
    let other = t.space(2);
    let (a, a_base) = t.anon(&space, 1, WiringMode::NoLock);
    t.write(&space, a_base, &[1; 4]);

    // 占满物理内存，每次低内存通知归还一页
    let held: Vec<usize> = core::iter::from_fn(|| t.phys.alloc(PageState::Active as u8)).collect();
    assert_eq!(t.phys.free_count(), 0);
    let held = std::sync::Mutex::new(held);
    let phys = t.phys.clone();
    t.platform.set_low_resource_hook(Box::new(move |_| {
        if let Some(pfn) = held.lock().unwrap().pop() {
            phys.free(pfn);
        }
    }));

    let b = shared_clone(&t, &other, a, AreaProtection::READ).unwrap();
    assert!(t.platform.low_resource_count() >= 1);
    assert_eq!(t.read(&other, t.base(b), 4), vec![1; 4]);
}
