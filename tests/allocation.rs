use std::sync::Arc;

use beltway::{
    belt::{BeltManager, BeltSpec},
    daemon::GcContext,
    heap::Heap,
    layout::{CellHeader, CellKind, CellLayout, ComponentKind, Hub},
    scheme::BeltwayScheme,
    Config, WORD_SIZE,
};

struct Leaf;

struct Bytes;

impl Hub for Bytes {
    fn id(&self) -> u32 {
        9
    }
    fn tuple_size(&self) -> usize {
        0
    }
    fn component_kind(&self) -> Option<ComponentKind> {
        Some(ComponentKind::Byte)
    }
}

impl Hub for Leaf {
    fn id(&self) -> u32 {
        7
    }
    fn tuple_size(&self) -> usize {
        CellLayout::HEADER_SIZE + WORD_SIZE
    }
}

fn config() -> Config {
    Config {
        max_heap_size: 4 * 1024 * 1024,
        initial_heap_size: 4 * 1024 * 1024,
        tlab_size: 8 * 1024,
        ..Config::default()
    }
}

/// Nursery in belt 0, survivors are promoted into belt 1. Only roots survive.
fn promoting_heap(config: Config) -> (Arc<Heap<BeltwayScheme>>, Arc<BeltManager>) {
    let belts = Arc::new(
        BeltManager::new(&config, &[BeltSpec::new(25, false), BeltSpec::new(75, false)]).unwrap(),
    );
    let collector_belts = belts.clone();
    let scheme = BeltwayScheme::new(
        belts.clone(),
        0,
        Arc::new(move |ctx: &mut GcContext<'_>| {
            ctx.reset_tlabs();
            let nursery = collector_belts.belt(0);
            let mature = collector_belts.belt(1);
            let layout = ctx.layout();
            ctx.roots_scanner()
                .run(&mut |slot: *mut *mut u8| unsafe {
                    let object = *slot;
                    if nursery.contains(object) {
                        let size = layout.object_size(object);
                        let copy = mature.gc_bump_allocate(size);
                        *slot = layout.plant_clone(copy, size, object);
                    }
                });
            nursery.reset_allocation_mark();
        }),
    );
    (Heap::new(config, scheme).unwrap(), belts)
}

#[test]
fn survivors_are_promoted_across_collections() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (heap, belts) = promoting_heap(config());
    let mut mutator = heap.attach_mutator();

    let mut roots = vec![std::ptr::null_mut::<u8>(); 16].into_boxed_slice();
    for (i, root) in roots.iter_mut().enumerate() {
        let object = mutator.create_tuple(&Leaf);
        unsafe { CellLayout::payload(object).cast::<usize>().write(i * 11) };
        *root = object;
        mutator.push_root(root);
    }

    // three times the nursery in garbage
    let mut garbage = 0;
    while garbage < 3 * 1024 * 1024 {
        assert!(!mutator.create_tuple(&Leaf).is_null());
        garbage += Leaf.tuple_size();
    }
    assert!(heap.invocation_count() >= 2);

    for (i, root) in roots.iter().enumerate() {
        assert!(belts.belt(1).contains(*root));
        assert!(heap.is_valid_ref(*root));
        assert_eq!(CellHeader::load(*root).hub_id(), 7);
        assert_eq!(unsafe { CellLayout::payload(*root).cast::<usize>().read() }, i * 11);
    }
    assert_eq!(belts.belt(1).used_memory(), 16 * Leaf.tuple_size());
    while mutator.pop_root().is_some() {}
}

#[test]
fn explicit_collection_reports_free_space() {
    let (heap, belts) = promoting_heap(config());
    let mut mutator = heap.attach_mutator();
    for _ in 0..100 {
        mutator.allocate_raw(1024);
    }
    assert!(belts.belt(0).used_memory() > 0);
    assert!(mutator.collect_garbage(1024));
    assert_eq!(heap.invocation_count(), 1);
    assert_eq!(belts.belt(0).used_memory(), 0);
    assert!(!mutator.collect_garbage(usize::MAX));
    assert_eq!(heap.report_used_space(), 0);
    assert_eq!(heap.report_free_space(), 4 * 1024 * 1024);
}

#[test]
fn filled_nursery_stays_walkable() {
    let (heap, belts) = promoting_heap(config());
    let mut mutator = heap.attach_mutator();
    let sizes = [24usize, 40, 1000, 8, 4000, 16, 7000, 64];
    let mut expected = 0;
    for size in sizes.iter().cycle().take(64) {
        assert!(!mutator.create_array(&Bytes, *size).is_null());
        expected += 1;
    }
    // make the current TLAB walkable as well
    unsafe { mutator.local_heap().reset_tlab(heap.layout()) };

    let nursery = belts.belt(0);
    let mut arrays = 0;
    let mut covered = 0;
    unsafe {
        CellLayout::walk(nursery.start(), nursery.allocation_mark(), |_, header| {
            covered += header.size();
            if header.kind() == CellKind::Array {
                assert_eq!(header.hub_id(), 9);
                arrays += 1;
            } else {
                assert_eq!(header.kind(), CellKind::Filler);
            }
        });
    }
    assert_eq!(arrays, expected);
    assert_eq!(covered, nursery.used_memory());
}

#[test]
fn without_tlabs_every_allocation_goes_to_the_belt() {
    let config = Config {
        use_tlab: false,
        ..config()
    };
    let (heap, belts) = promoting_heap(config);
    let mut mutator = heap.attach_mutator();
    let first = mutator.allocate_raw(32);
    let second = mutator.allocate_raw(32);
    assert_eq!(first, belts.belt(0).start());
    assert_eq!(second, unsafe { first.add(32) });
    assert_eq!(heap.tlab_stats().overflows(), 2);
    assert_eq!(heap.tlab_stats().refills(), 0);
}
