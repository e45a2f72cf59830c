use memsim::{
    allocator::{
        AllocError, Allocator, BuddyAllocator, EngineStats, LayoutEntry, Placement,
    },
    simulator::{Response, Simulator, SimulatorConfig},
};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn free_summary(layout: &[LayoutEntry]) -> (u64, usize) {
    let free = layout.iter().filter(|entry| entry.is_free());
    (free.clone().map(|entry| entry.size).sum(), free.count())
}

fn assert_partition(layout: &[LayoutEntry], total: u64) {
    let mut expected_start = 0;
    for entry in layout {
        assert_eq!(entry.start, expected_start, "gap or overlap in {layout:?}");
        expected_start += entry.size;
    }
    assert_eq!(expected_start, total);

    for pair in layout.windows(2) {
        assert!(!(pair[0].is_free() && pair[1].is_free()), "adjacent free blocks in {layout:?}");
    }
}

fn assert_no_free_buddies(allocator: &BuddyAllocator) {
    for order in 0..allocator.max_order() {
        let free: Vec<_> = allocator.free_blocks(order).collect();
        for addr in &free {
            let buddy = addr ^ (1 << order);
            assert!(!free.contains(&buddy), "{addr:#x} and {buddy:#x} both free at order {order}");
        }
    }
}

fn run(simulator: &mut Simulator, line: &str) -> String {
    match simulator.run_line(line) {
        Ok(Response::Report(report)) => report,
        other => panic!("{line}: unexpected {other:?}"),
    }
}

#[test]
fn first_fit_reuses_the_first_hole() {
    let mut simulator = Simulator::new(SimulatorConfig::default()).unwrap();
    run(&mut simulator, "init memory 1024");
    run(&mut simulator, "malloc 100");
    run(&mut simulator, "malloc 200");
    run(&mut simulator, "free 1");

    assert_eq!(run(&mut simulator, "malloc 50"), "Allocated block id=3 at address=0x0 (cache: L1 hit)");
}

#[test]
fn best_fit_and_worst_fit_pick_different_holes() {
    for (placement, expected) in [("best_fit", "0x0"), ("worst_fit", "0x3c")] {
        let mut simulator = Simulator::new(SimulatorConfig::default()).unwrap();
        run(&mut simulator, "init memory 1024");
        run(&mut simulator, &format!("set allocator {placement}"));
        run(&mut simulator, "malloc 50");
        run(&mut simulator, "malloc 10");
        run(&mut simulator, "malloc 200");
        run(&mut simulator, "malloc 764");
        run(&mut simulator, "free 1");
        run(&mut simulator, "free 3");

        assert_eq!(
            run(&mut simulator, "malloc 40"),
            format!("Allocated block id=5 at address={expected} (cache: L1 hit)"),
        );
    }
}

#[test]
fn buddy_splits_and_merges_back_to_the_root() {
    let mut engine = Allocator::buddy(1024).unwrap();

    let allocation = engine.allocate(100).unwrap();
    assert_eq!((allocation.address, allocation.size), (0, 128));

    engine.release(allocation.id).unwrap();
    let layout = engine.dump();
    assert_eq!(layout.len(), 1);
    assert_eq!((layout[0].start, layout[0].size), (0, 1024));
}

#[test]
fn buddy_failure_leaves_the_free_set_unchanged() {
    let mut engine = Allocator::buddy(256).unwrap();
    let before = engine.dump();

    assert_eq!(engine.allocate(300), Err(AllocError::AllocationFailed { size: 300 }));
    assert_eq!(engine.dump(), before);
}

#[test]
fn allocate_then_release_restores_free_space() {
    let engines = [
        Allocator::free_list(1000, Placement::FirstFit),
        Allocator::free_list(1000, Placement::BestFit),
        Allocator::free_list(1000, Placement::WorstFit),
        Allocator::buddy(1024).unwrap(),
    ];

    for mut engine in engines {
        // Some live allocations first, so the round trip does not
        // start from an empty engine.
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..6 {
            engine.allocate(rng.random_range(1..=60)).unwrap();
        }
        engine.release(2).unwrap();
        engine.release(5).unwrap();

        for size in [1, 17, 64, 100] {
            let before = free_summary(&engine.dump());
            let allocation = engine.allocate(size).unwrap();
            engine.release(allocation.id).unwrap();
            assert_eq!(free_summary(&engine.dump()), before, "{engine:?} size {size}");
        }
    }
}

#[test]
fn free_list_invariants_hold_under_random_traffic() {
    for placement in [Placement::FirstFit, Placement::BestFit, Placement::WorstFit] {
        let total = 4096;
        let mut engine = Allocator::free_list(total, placement);
        let mut rng = StdRng::seed_from_u64(0x42);
        let mut live = Vec::new();

        for _ in 0..500 {
            if live.is_empty() || rng.random_bool(0.6) {
                if let Ok(allocation) = engine.allocate(rng.random_range(1..=300)) {
                    live.push(allocation.id);
                }
            } else {
                let id = live.swap_remove(rng.random_range(0..live.len()));
                engine.release(id).unwrap();
            }
            assert_partition(&engine.dump(), total);
        }

        let EngineStats::FreeList(stats) = engine.stats() else {
            panic!("free-list engine reported buddy stats");
        };
        assert_eq!(stats.used + stats.free, total);
        assert!(stats.external_fragmentation() >= 0.0 && stats.external_fragmentation() < 100.0);
    }
}

#[test]
fn buddy_invariants_hold_under_random_traffic() {
    let mut allocator = BuddyAllocator::new(1 << 12).unwrap();
    let mut rng = StdRng::seed_from_u64(1234);
    let mut live = Vec::new();

    for _ in 0..500 {
        if live.is_empty() || rng.random_bool(0.6) {
            let size = rng.random_range(1..=400u64);
            if let Ok(allocation) = allocator.allocate(size) {
                live.push((allocation.id, allocation.size - size));
            }
        } else {
            let (id, _) = live.swap_remove(rng.random_range(0..live.len()));
            allocator.release(id).unwrap();
            assert_no_free_buddies(&allocator);
        }

        let wasted: u64 = live.iter().map(|(_, wasted)| wasted).sum();
        assert_eq!(allocator.internal_fragmentation(), wasted);

        let stats = allocator.stats();
        assert_eq!(stats.allocated + stats.free, stats.total);
    }

    for (id, _) in live.drain(..) {
        allocator.release(id).unwrap();
    }
    assert_eq!(allocator.free_blocks(12).collect::<Vec<_>>(), vec![0]);
    assert_eq!(allocator.internal_fragmentation(), 0);
}
