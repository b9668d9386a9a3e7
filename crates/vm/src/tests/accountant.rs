use super::*;

use proptest::prelude::*;

use crate::accountant::{Accountant, MemoryPriority};

const P: usize = PAGE_SIZE;

fn accountant(total: usize, user_reserve: usize, system_reserve: usize) -> (Arc<MockPlatform>, Arc<Accountant>) {
    let platform = Arc::new(MockPlatform::new());
    let accountant = Arc::new(Accountant::new(total, user_reserve, system_reserve, platform.clone()));
    (platform, accountant)
}

#[test]
fn test_reserve_and_unreserve() {
    let (_, acc) = accountant(8 * P, 0, 0);
    acc.reserve(3 * P, MemoryPriority::User, Duration::ZERO).unwrap();
    assert_eq!(acc.available(), 5 * P);
    acc.reserve(5 * P, MemoryPriority::User, Duration::ZERO).unwrap();
    assert_eq!(acc.available(), 0);

    acc.unreserve(8 * P);
    let snapshot = acc.snapshot();
    assert_eq!(snapshot.available, snapshot.total);
    assert_eq!(snapshot.needed, 0);
}

#[test]
fn test_zero_reserve_always_succeeds() {
    let (platform, acc) = accountant(P, 0, 0);
    acc.reserve(P, MemoryPriority::User, Duration::ZERO).unwrap();
    acc.reserve(0, MemoryPriority::User, Duration::ZERO).unwrap();
    assert_eq!(platform.low_resource_count(), 0);
}

#[test]
fn test_non_blocking_reserve_does_not_wait() {
    let (platform, acc) = accountant(2 * P, 0, 0);
    acc.try_reserve_non_blocking(2 * P, MemoryPriority::User).unwrap();
    assert_eq!(
        acc.try_reserve_non_blocking(P, MemoryPriority::User),
        Err(VmError::WouldBlock)
    );
    assert_eq!(acc.available(), 0);
    assert_eq!(platform.low_resource_count(), 0);
}

#[test]
fn test_priority_floors() {
    let (_, acc) = accountant(8 * P, 2 * P, P);
    acc.reserve(6 * P, MemoryPriority::User, Duration::ZERO).unwrap();
    assert_eq!(
        acc.try_reserve_non_blocking(P, MemoryPriority::User),
        Err(VmError::WouldBlock)
    );

    // 内核请求可以动用用户保留量，但不能动用系统保留量
    acc.try_reserve_non_blocking(P, MemoryPriority::System).unwrap();
    assert_eq!(
        acc.try_reserve_non_blocking(P, MemoryPriority::System),
        Err(VmError::WouldBlock)
    );

    acc.try_reserve_non_blocking(P, MemoryPriority::Vip).unwrap();
    assert_eq!(acc.available(), 0);
}

#[test]
fn test_reserve_times_out_and_clears_needed() {
    let (platform, acc) = accountant(4 * P, 0, 0);
    acc.reserve(3 * P, MemoryPriority::User, Duration::ZERO).unwrap();

    let result = acc.reserve(2 * P, MemoryPriority::User, Duration::from_millis(10));
    assert_eq!(result, Err(VmError::Timeout));
    assert_eq!(acc.available(), P);
    assert_eq!(acc.needed(), 0);
    assert!(platform.low_resource_count() >= 1);
    assert!(platform.yield_count() >= 1);
}

#[test]
fn test_reserve_waits_for_reclaim() {
    let (platform, acc) = accountant(4 * P, 0, 0);
    acc.reserve(4 * P, MemoryPriority::User, Duration::ZERO).unwrap();

    // 模拟回收：每次低内存通知归还一页
    let weak = Arc::downgrade(&acc);
    platform.set_low_resource_hook(Box::new(move |_| {
        if let Some(acc) = weak.upgrade() {
            acc.unreserve(P);
        }
    }));

    acc.reserve(2 * P, MemoryPriority::User, Duration::MAX).unwrap();
    assert_eq!(acc.available(), 0);
    assert_eq!(acc.needed(), 0);
    assert_eq!(platform.low_resource_count(), 2);
}

#[test]
fn test_overcommit_area_commits_per_page() {
    let t = TestVm::new(32);
    let space = t.space(1);
    let before = t.vm.accountant().available();

    let (id, base) = t.anon(&space, 4, WiringMode::NoLock);
    assert_eq!(t.vm.accountant().available(), before);
    assert_eq!(t.vm.area_cache(id).unwrap().info().committed, 0);

    t.write(&space, base + PAGE_SIZE, &[1; 4]);
    t.write(&space, base + 3 * PAGE_SIZE, &[1; 4]);
    assert_eq!(t.vm.area_cache(id).unwrap().info().committed, 2 * PAGE_SIZE);
    assert_eq!(t.vm.accountant().available(), before - 2 * PAGE_SIZE);

    t.vm.delete_area(&space, id).unwrap();
    assert_eq!(t.vm.accountant().available(), before);
}

#[test]
fn test_wired_area_beyond_memory_fails() {
    let t = TestVm::new(8);
    let space = t.space(1);
    let before = t.vm.accountant().available();

    let result = t.vm.create_area(
        &space,
        "huge",
        AddressSpec::Any,
        16 * PAGE_SIZE,
        WiringMode::FullLock,
        AreaProtection::READ | AreaProtection::WRITE,
        AreaBacking::Anonymous,
        0,
    );
    assert_eq!(result, Err(VmError::Timeout));
    assert_eq!(t.vm.accountant().available(), before);
    assert_eq!(space.area_count(), 0);
    assert!(t.platform.low_resource_count() >= 1);
}

#[derive(Debug, Clone)]
enum Op {
    Reserve(usize),
    TryReserve(usize),
    Unreserve(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..6).prop_map(|pages| Op::Reserve(pages * P)),
        (0usize..6).prop_map(|pages| Op::TryReserve(pages * P)),
        (0usize..6).prop_map(|pages| Op::Unreserve(pages * P)),
    ]
}

proptest! {
    #[test]
    fn test_available_tracks_outstanding_commitment(ops in proptest::collection::vec(arb_op(), 1..40)) {
        let (_, acc) = accountant(16 * P, 0, 0);
        let mut outstanding = 0usize;
        for op in ops {
            match op {
                Op::Reserve(amount) => {
                    if acc.reserve(amount, MemoryPriority::User, Duration::ZERO).is_ok() {
                        outstanding += amount;
                    }
                }
                Op::TryReserve(amount) => {
                    if acc.try_reserve_non_blocking(amount, MemoryPriority::User).is_ok() {
                        outstanding += amount;
                    }
                }
                Op::Unreserve(amount) => {
                    let amount = amount.min(outstanding);
                    acc.unreserve(amount);
                    outstanding -= amount;
                }
            }
            let snapshot = acc.snapshot();
            prop_assert!(snapshot.available <= snapshot.total);
            prop_assert_eq!(snapshot.available, snapshot.total - outstanding);
            prop_assert_eq!(snapshot.needed, 0);
        }
    }
}
