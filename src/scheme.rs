//! Heap schemes: the part of a collector that decides where memory comes from once a TLAB is
//! exhausted.

use std::{ptr::null_mut, sync::Arc};

use crate::{
    belt::{Belt, BeltManager},
    daemon::Collector,
    heap::Heap,
    layout::ObjectLayout,
    local_heap::LocalHeap,
    tlab::Tlab,
};

/// Number of collections a failing allocation may request before it reports out of memory.
pub const COLLECTION_RETRIES: usize = 2;

pub trait HeapScheme: Send + Sync + Sized + 'static {
    /// Called on the owning thread when its TLAB cannot satisfy `size` bytes. Either refills
    /// the TLAB through [Heap::refill_tlab] and allocates from it, or allocates the cell
    /// somewhere else. Returns null when the heap is exhausted even after collecting.
    fn handle_tlab_overflow(&self, heap: &Heap<Self>, local: &LocalHeap, size: usize) -> *mut u8;

    /// Makes the TLAB about to be replaced walkable.
    fn do_before_tlab_refill(&self, local: &LocalHeap, layout: &dyn ObjectLayout) {
        unsafe { local.tlab().fill_tlab(layout) }
    }

    fn contains(&self, addr: *const u8) -> bool;

    fn report_free_space(&self) -> usize;

    fn report_used_space(&self) -> usize;

    fn reserved_space(&self) -> usize;

    /// Collector run by requested and by periodic collections.
    fn collector(&self) -> Arc<dyn Collector>;

    /// Prevents `object` from moving. Returns false when the scheme does not support pinning.
    fn pin(&self, _object: *mut u8) -> bool {
        false
    }

    fn unpin(&self, _object: *mut u8) {}

    fn is_pinned(&self, _object: *mut u8) -> bool {
        false
    }
}

/// Allocates TLABs and overflowing cells from one belt of a [BeltManager].
pub struct BeltwayScheme {
    belts: Arc<BeltManager>,
    allocation_belt: usize,
    collector: Arc<dyn Collector>,
}

impl BeltwayScheme {
    pub fn new(belts: Arc<BeltManager>, allocation_belt: usize, collector: Arc<dyn Collector>) -> Self {
        assert!(
            allocation_belt < belts.belts().len(),
            "allocation belt {} out of range",
            allocation_belt
        );
        Self {
            belts,
            allocation_belt,
            collector,
        }
    }

    pub fn belts(&self) -> &Arc<BeltManager> {
        &self.belts
    }

    pub fn allocation_belt(&self) -> &Belt {
        self.belts.belt(self.allocation_belt)
    }

    /// Runs `allocate` against the allocation belt, collecting when it fails.
    fn allocate_with_retry(
        &self,
        heap: &Heap<Self>,
        local: &LocalHeap,
        size: usize,
        allocate: impl Fn(&Belt) -> *mut u8,
    ) -> *mut u8 {
        let mut collections = 0;
        loop {
            let cell = allocate(self.allocation_belt());
            if !cell.is_null() {
                return cell;
            }
            if collections == COLLECTION_RETRIES {
                log::debug!(
                    target: "gc",
                    "thread {}: {} bytes still unavailable after {} collections",
                    local.name(),
                    size,
                    collections
                );
                return null_mut();
            }
            collections += 1;
            heap.collect_garbage(Some(local), size);
        }
    }
}

impl HeapScheme for BeltwayScheme {
    fn handle_tlab_overflow(&self, heap: &Heap<Self>, local: &LocalHeap, size: usize) -> *mut u8 {
        let headroom = Tlab::headroom(heap.config().debug_tagging);
        let (refill, next_size) = unsafe {
            let policy = local.refill_policy_or_init();
            let next_size = policy.next_tlab_size();
            let mark = local.tlab().mark();
            (
                size + headroom <= next_size && policy.should_refill(size, mark),
                next_size,
            )
        };

        if !refill {
            heap.tlab_stats().record_overflow();
            return self.allocate_with_retry(heap, local, size, |belt| belt.allocate(size));
        }

        let chunk =
            self.allocate_with_retry(heap, local, next_size, |belt| belt.allocate_chunk(next_size));
        if chunk.is_null() {
            return null_mut();
        }
        unsafe { heap.refill_tlab(local, chunk, next_size) };
        local.tlab_allocate(size, heap.layout())
    }

    fn contains(&self, addr: *const u8) -> bool {
        self.belts.contains(addr)
    }

    fn report_free_space(&self) -> usize {
        self.belts.free_memory()
    }

    fn report_used_space(&self) -> usize {
        self.belts.used_memory()
    }

    fn reserved_space(&self) -> usize {
        self.belts.reserved_size()
    }

    fn collector(&self) -> Arc<dyn Collector> {
        self.collector.clone()
    }
}
