use super::*;

fn private_clone(t: &TestVm, space: &Arc<AddressSpace>, source: AreaId) -> (AreaId, usize) {
    let id = t
        .vm
        .clone_area(
            space,
            "private",
            AddressSpec::Any,
            AreaProtection::READ | AreaProtection::WRITE,
            MappingKind::Private,
            source,
        )
        .unwrap();
    (id, t.base(id))
}

#[test]
fn test_private_clone_writes_stay_private() {
    let t = TestVm::new(64);
    let space = t.space(1);
    let (a, a_base) = t.anon(&space, 2, WiringMode::NoLock);
    t.write(&space, a_base, &[b'a'; 64]);
    t.write(&space, a_base + PAGE_SIZE, &[b'A'; 64]);
    let source = t.vm.area_cache(a).unwrap();

    let (b, b_base) = private_clone(&t, &space, a);
    t.write(&space, b_base, &[b'b'; 64]);

    assert_eq!(t.read(&space, a_base, 64), vec![b'a'; 64]);
    assert_eq!(t.read(&space, b_base, 64), vec![b'b'; 64]);
    // 未写过的页透过父缓存读到源的内容
    assert_eq!(t.read(&space, b_base + PAGE_SIZE, 64), vec![b'A'; 64]);

    // 源区域被提升，原缓存成为双方共同的下层
    assert_eq!(source.page_count(), 2);
    assert_eq!(t.vm.area_cache(a).unwrap().page_count(), 0);
    assert_eq!(t.vm.area_cache(b).unwrap().page_count(), 1);
    assert_eq!(t.vm.get_area_info(b).unwrap().copy_depth, 1);
    assert_eq!(t.vm.stats().snapshot().copy_on_write, 1);
}

#[test]
fn test_source_writes_after_private_clone_stay_hidden() {
    let t = TestVm::new(64);
    let space = t.space(1);
    let (a, a_base) = t.anon(&space, 2, WiringMode::NoLock);
    t.write(&space, a_base, &[b'a'; 8]);
    let (b, b_base) = private_clone(&t, &space, a);
    assert_eq!(t.read(&space, b_base, 8), vec![b'a'; 8]);

    t.write(&space, a_base, &[b'X'; 8]);
    // 源在克隆之后才第一次写的页
    t.write(&space, a_base + PAGE_SIZE, &[b'Y'; 8]);

    assert_eq!(t.read(&space, a_base, 8), vec![b'X'; 8]);
    assert_eq!(t.read(&space, b_base, 8), vec![b'a'; 8]);
    assert_eq!(t.read(&space, b_base + PAGE_SIZE, 8), vec![0; 8]);
    assert_eq!(t.vm.get_area_info(a).unwrap().copy_depth, 1);
    assert_eq!(t.vm.area_cache(b).unwrap().page_count(), 0);
}

#[test]
fn test_private_mapping_of_cache_hides_later_source_writes() {
    let t = TestVm::new(64);
    let space = t.space(1);
    let other = t.space(2);
    let (a, a_base) = t.anon(&space, 1, WiringMode::NoLock);
    t.write(&space, a_base, &[b'a'; 8]);
    let source = t.vm.area_cache(a).unwrap();

    let id = t
        .vm
        .create_area(
            &other,
            "private",
            AddressSpec::Any,
            PAGE_SIZE,
            WiringMode::NoLock,
            AreaProtection::READ | AreaProtection::WRITE,
            AreaBacking::Cache {
                cache: source.clone(),
                mapping: MappingKind::Private,
            },
            0,
        )
        .unwrap();
    let base = t.base(id);
    assert_eq!(t.read(&other, base, 8), vec![b'a'; 8]);

    t.write(&space, a_base, &[b'X'; 8]);
    assert_eq!(t.read(&other, base, 8), vec![b'a'; 8]);
    assert_eq!(t.read(&space, a_base, 8), vec![b'X'; 8]);
    assert_ne!(t.vm.area_cache(a).unwrap().id(), source.id());
    assert_eq!(source.page_count(), 1);
}

#[test]
fn test_private_clone_of_read_only_source_skips_promotion() {
    let t = TestVm::new(64);
    let space = t.space(1);
    let (a, a_base) = t.anon(&space, 1, WiringMode::NoLock);
    t.write(&space, a_base, &[7; 8]);
    t.vm.set_area_protection(a, AreaProtection::READ).unwrap();
    let source = t.vm.area_cache(a).unwrap();

    let (_, b_base) = private_clone(&t, &space, a);
    assert_eq!(t.vm.area_cache(a).unwrap().id(), source.id());
    assert_eq!(source.info().consumer_count, 1);
    assert_eq!(t.read(&space, b_base, 8), vec![7; 8]);
}

#[test]
fn test_read_fault_fills_the_deepest_cache() {
    let t = TestVm::new(64);
    let space = t.space(1);
    let (a, _) = t.anon(&space, 1, WiringMode::NoLock);
    let source = t.vm.area_cache(a).unwrap();
    let (b, b_base) = private_clone(&t, &space, a);
    let private = t.vm.area_cache(b).unwrap();

    assert_eq!(t.touch(&space, b_base), FaultOutcome::Resolved);
    assert_eq!(source.page_count(), 1);
    assert_eq!(private.page_count(), 0);
    // 页不属于私有层，映射只读
    assert!(!t.query(&space, b_base).unwrap().protection.contains(AreaProtection::WRITE));

    t.write(&space, b_base, &[1; 8]);
    assert_eq!(source.page_count(), 1);
    assert_eq!(private.page_count(), 1);
    assert!(t.query(&space, b_base).unwrap().protection.contains(AreaProtection::WRITE));
}

#[test]
fn test_cow_fault_is_idempotent() {
    let t = TestVm::new(64);
    let space = t.space(1);
    let (a, a_base) = t.anon(&space, 1, WiringMode::NoLock);
    t.write(&space, a_base, &[5; 8]);
    let (shared, _) = t.vm.area_cache(a).unwrap().page_at(0).unwrap();
    let (_, b_base) = private_clone(&t, &space, a);

    assert_eq!(t.touch(&space, b_base), FaultOutcome::Resolved);
    let first = t.query(&space, b_base).unwrap();
    assert_eq!(t.touch(&space, b_base), FaultOutcome::Resolved);
    let second = t.query(&space, b_base).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.ppn, shared);
    let ours = t
        .vm
        .mapping_table()
        .mappings_of(shared)
        .iter()
        .filter(|m| m.space == space.id() && m.address == b_base)
        .count();
    assert_eq!(ours, 1);
    // A 与 B 各一条映射
    assert_eq!(t.vm.mapping_table().mapping_count(shared), 2);
}

#[test]
fn test_copy_area_isolates_both_sides() {
    let t = TestVm::new(64);
    let space = t.space(1);
    let other = t.space(2);
    let (a, a_base) = t.anon(&space, 2, WiringMode::NoLock);
    t.write(&space, a_base, &[b'o'; 32]);
    t.write(&space, a_base + PAGE_SIZE, &[b'O'; 32]);
    let original = t.vm.area_cache(a).unwrap();

    let c = t
        .vm
        .copy_area(&other, "copy", AddressSpec::Any, AreaProtection::READ | AreaProtection::WRITE, a)
        .unwrap();
    let c_base = t.base(c);

    // 源区域被提升到新的私有层之上，映射降为只读
    let upper = t.vm.area_cache(a).unwrap();
    assert_ne!(upper.id(), original.id());
    assert_eq!(upper.source().map(|s| s.id()), Some(original.id()));
    assert!(!t.query(&space, a_base).unwrap().protection.contains(AreaProtection::WRITE));

    t.write(&space, a_base, &[b'x'; 32]);
    t.write(&other, c_base + PAGE_SIZE, &[b'y'; 32]);

    assert_eq!(t.read(&space, a_base, 32), vec![b'x'; 32]);
    assert_eq!(t.read(&other, c_base, 32), vec![b'o'; 32]);
    assert_eq!(t.read(&other, c_base + PAGE_SIZE, 32), vec![b'y'; 32]);
    assert_eq!(t.read(&space, a_base + PAGE_SIZE, 32), vec![b'O'; 32]);

    // 共同祖先中的页数不变
    assert_eq!(original.page_count(), 2);
    assert_eq!(t.vm.get_area_info(a).unwrap().copy_depth, 1);
    assert_eq!(t.vm.get_area_info(c).unwrap().copy_depth, 1);
}

#[test]
fn test_copy_of_read_only_area_skips_promotion() {
    let t = TestVm::new(64);
    let space = t.space(1);
    let (a, a_base) = t.anon(&space, 1, WiringMode::NoLock);
    t.write(&space, a_base, &[1; 8]);
    t.vm.set_area_protection(a, AreaProtection::READ).unwrap();
    let original = t.vm.area_cache(a).unwrap();

    let c = t
        .vm
        .copy_area(&space, "copy", AddressSpec::Any, AreaProtection::READ | AreaProtection::WRITE, a)
        .unwrap();
    assert_eq!(t.vm.area_cache(a).unwrap().id(), original.id());
    assert_eq!(t.vm.get_area_info(c).unwrap().copy_depth, 1);
    assert_eq!(original.info().consumer_count, 1);
}

#[test]
fn test_copy_of_device_area_is_rejected() {
    let t = TestVm::new(16);
    let space = t.space(1);
    let mmio = t
        .vm
        .create_area(
            &space,
            "mmio",
            AddressSpec::Any,
            PAGE_SIZE,
            WiringMode::NoLock,
            AreaProtection::READ,
            AreaBacking::Physical(Ppn(0x7000)),
            0,
        )
        .unwrap();

    let result = t.vm.copy_area(&space, "copy", AddressSpec::Any, AreaProtection::READ, mmio);
    assert_eq!(result, Err(VmError::InvalidArgs));
}

#[test]
fn test_making_source_writable_promotes_it() {
    let t = TestVm::new(64);
    let space = t.space(1);
    let (a, a_base) = t.anon(&space, 1, WiringMode::NoLock);
    t.write(&space, a_base, &[b's'; 16]);
    t.vm.set_area_protection(a, AreaProtection::READ).unwrap();
    let c = t
        .vm
        .copy_area(&space, "copy", AddressSpec::Any, AreaProtection::READ, a)
        .unwrap();
    let c_base = t.base(c);
    let original = t.vm.area_cache(a).unwrap();

    t.vm.set_area_protection(a, AreaProtection::READ | AreaProtection::WRITE).unwrap();
    assert_ne!(t.vm.area_cache(a).unwrap().id(), original.id());

    t.write(&space, a_base, &[b'z'; 16]);
    assert_eq!(t.read(&space, c_base, 16), vec![b's'; 16]);
    assert_eq!(t.read(&space, a_base, 16), vec![b'z'; 16]);
    assert_eq!(original.page_count(), 1);
}

#[test]
fn test_deleting_the_copy_releases_its_layer() {
    let t = TestVm::new(64);
    let space = t.space(1);
    let (a, a_base) = t.anon(&space, 1, WiringMode::NoLock);
    t.write(&space, a_base, &[1; 8]);
    let source = t.vm.area_cache(a).unwrap();
    let (b, b_base) = private_clone(&t, &space, a);
    t.write(&space, b_base, &[2; 8]);
    let private = Arc::downgrade(&t.vm.area_cache(b).unwrap());
    // 源区域的新顶层与私有层
    assert_eq!(source.info().consumer_count, 2);

    t.vm.delete_area(&space, b).unwrap();
    assert!(private.upgrade().is_none());
    assert_eq!(source.info().consumer_count, 1);
    assert_eq!(t.read(&space, a_base, 8), vec![1; 8]);
}
