use std::{cell::Cell, marker::PhantomData, sync::Arc, thread::JoinHandle};

use crate::{
    error::{HeapError, HeapResult},
    heap::Heap,
    layout::Hub,
    local_heap::{LocalHeap, ThreadState},
    scheme::HeapScheme,
    util::align_up,
    WORD_SIZE,
};

/// A thread attached to a [Heap]. All allocation goes through a mutator.
///
/// The mutator starts out running. It must poll [Mutator::safepoint] regularly and park around
/// anything that blocks, otherwise a collection requested by another thread waits for it.
pub struct Mutator<S: HeapScheme> {
    heap: Arc<Heap<S>>,
    local: Box<LocalHeap>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<S: HeapScheme> Mutator<S> {
    /// Registers a new parked thread with the heap.
    pub(crate) fn attach_parked(heap: Arc<Heap<S>>, name: String) -> Self {
        let local = LocalHeap::new(heap.safepoint().clone(), heap.config(), name);
        unsafe { heap.safepoint().add_local_heap(&local) };
        Self {
            heap,
            local,
            _not_sync: PhantomData,
        }
    }

    /// Spawns a thread attached to the same heap and runs `closure` on it. The new mutator is
    /// detached when the closure returns.
    pub fn spawn<F, R>(&self, name: &str, closure: F) -> HeapResult<JoinHandle<R>>
    where
        F: FnOnce(&mut Mutator<S>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.local.park();
        let mut mutator = Mutator::attach_parked(self.heap.clone(), name.to_string());
        self.local.unpark();
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                mutator.unpark();
                closure(&mut mutator)
            })
            .map_err(|source| HeapError::ThreadSpawn {
                name: "mutator",
                source,
            })
    }

    pub fn heap(&self) -> &Arc<Heap<S>> {
        &self.heap
    }

    pub fn local_heap(&self) -> &LocalHeap {
        &self.local
    }

    pub fn state(&self) -> ThreadState {
        self.local.state()
    }

    /// Polls for a pending stop-the-world request and blocks until it is over. Returns true if
    /// the thread stopped.
    #[inline(always)]
    pub fn safepoint(&self) -> bool {
        self.local.safepoint()
    }

    /// Leaves managed code. A parked thread does not hold up collections and must not touch
    /// the heap.
    pub fn park(&self) {
        self.local.park();
    }

    pub fn unpark(&self) {
        self.local.unpark();
    }

    /// Runs `f` parked, for calls that may block.
    pub fn parked<R>(&self, f: impl FnOnce() -> R) -> R {
        self.local.park();
        let result = f();
        self.local.unpark();
        result
    }

    /// Registers a slot holding a reference into the heap. A moving collector updates it.
    pub fn push_root(&self, slot: *mut *mut u8) {
        self.local.push_root(slot);
    }

    pub fn pop_root(&self) -> Option<*mut *mut u8> {
        self.local.pop_root()
    }

    /// Allocates a raw cell of `size` bytes, rounded up to words. Returns null when the heap is
    /// exhausted even after collecting.
    #[inline(always)]
    pub fn allocate_raw(&mut self, size: usize) -> *mut u8 {
        let size = align_up(size, WORD_SIZE);
        let cell = self.local.tlab_allocate(size, self.heap.layout());
        if !cell.is_null() {
            return cell;
        }
        self.allocate_slow(size)
    }

    #[cold]
    #[inline(never)]
    fn allocate_slow(&mut self, size: usize) -> *mut u8 {
        if self.local.is_allocation_disabled() {
            crate::fatal!(
                "allocation of {} bytes on thread {} while allocation is disabled",
                size,
                self.local.name()
            );
        }
        self.heap.tlab_stats().record_slow_path();
        if self.local.is_immortal_allocation_enabled() {
            return self.heap.immortal().allocate(size);
        }
        self.heap
            .scheme()
            .handle_tlab_overflow(&self.heap, &self.local, size)
    }

    /// Like [Mutator::allocate_raw] but treats exhaustion as fatal.
    pub fn allocate_or_abort(&mut self, size: usize) -> *mut u8 {
        let cell = self.allocate_raw(size);
        if cell.is_null() {
            crate::fatal!(
                "out of memory: {} bytes requested on thread {}",
                size,
                self.local.name()
            );
        }
        cell
    }

    /// Allocates an array of `length` elements of the component kind of `hub`.
    pub fn create_array(&mut self, hub: &dyn Hub, length: usize) -> *mut u8 {
        let kind = match hub.component_kind() {
            Some(kind) => kind,
            None => crate::fatal!("hub {} does not describe an array", hub.id()),
        };
        let size = self.heap.layout().array_size(kind, length);
        let cell = self.allocate_raw(size);
        if cell.is_null() {
            return cell;
        }
        unsafe { self.heap.layout().plant_array(cell, size, hub, length) }
    }

    /// Allocates a tuple and registers it for finalization if its type has a finalizer.
    pub fn create_tuple(&mut self, hub: &dyn Hub) -> *mut u8 {
        let cell = self.allocate_raw(hub.tuple_size());
        if cell.is_null() {
            return cell;
        }
        let object = unsafe { self.heap.layout().plant_tuple(cell, hub) };
        if hub.has_finalizer() {
            self.heap.references().register_finalizee(object, hub);
        }
        object
    }

    /// Allocates the unexpanded cell of a hybrid. The cell always has room for the length
    /// word, even when the hub declares no fields.
    pub fn create_hybrid(&mut self, hub: &dyn Hub) -> *mut u8 {
        let size = hub.tuple_size().max(self.heap.layout().hybrid_size(0));
        let cell = self.allocate_raw(size);
        if cell.is_null() {
            return cell;
        }
        unsafe { self.heap.layout().plant_hybrid(cell, size, hub) }
    }

    /// Allocates a copy of `hybrid` grown to `length` elements.
    ///
    /// # Safety
    /// `hybrid` must be a live hybrid planted by the heap's layout.
    pub unsafe fn expand_hybrid(&mut self, hybrid: *const u8, length: usize) -> *mut u8 {
        let size = self.heap.layout().hybrid_size(length);
        let cell = self.allocate_raw(size);
        if cell.is_null() {
            return cell;
        }
        self.heap
            .layout()
            .plant_expanded_hybrid(cell, size, hybrid, length)
    }

    /// Allocates a shallow copy of `object`.
    ///
    /// # Safety
    /// `object` must be a live object planted by the heap's layout.
    pub unsafe fn clone(&mut self, object: *const u8) -> *mut u8 {
        let size = self.heap.layout().object_size(object);
        let cell = self.allocate_raw(size);
        if cell.is_null() {
            return cell;
        }
        self.heap.layout().plant_clone(cell, size, object)
    }

    /// Forbids allocation on this thread until the matching [Mutator::enable_allocation].
    /// Calls nest; an enable without a disable is fatal.
    pub fn disable_allocation(&self) {
        self.local.disable_allocation();
    }

    pub fn enable_allocation(&self) {
        self.local.enable_allocation();
    }

    pub fn is_allocation_disabled(&self) -> bool {
        self.local.is_allocation_disabled()
    }

    /// Routes all allocation of this thread to the immortal region.
    pub fn enable_immortal_allocation(&self) {
        self.local.enable_immortal_allocation();
    }

    pub fn disable_immortal_allocation(&self) {
        self.local.disable_immortal_allocation();
    }

    /// Requests a collection and reports whether `requested` bytes are free afterwards.
    pub fn collect_garbage(&self, requested: usize) -> bool {
        self.heap.collect_garbage(Some(&self.local), requested)
    }

    pub fn pin(&self, object: *mut u8) -> bool {
        self.heap.pin(object)
    }

    pub fn unpin(&self, object: *mut u8) {
        self.heap.unpin(object)
    }

    pub fn is_pinned(&self, object: *mut u8) -> bool {
        self.heap.is_pinned(object)
    }
}

impl<S: HeapScheme> Drop for Mutator<S> {
    fn drop(&mut self) {
        if !self.local.is_parked() {
            unsafe { self.local.reset_tlab(self.heap.layout()) };
            self.local.park();
        }
        unsafe { self.heap.safepoint().remove_local_heap(&self.local) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        belt::{BeltManager, BeltSpec},
        daemon::GcContext,
        layout::{tests::TestHub, CellHeader, CellKind, CellLayout, ComponentKind},
        scheme::BeltwayScheme,
        Config,
    };

    fn heap(config: Config) -> (Arc<Heap<BeltwayScheme>>, Arc<BeltManager>) {
        let belts = Arc::new(BeltManager::new(&config, &[BeltSpec::new(100, false)]).unwrap());
        let collector_belts = belts.clone();
        let scheme = BeltwayScheme::new(
            belts.clone(),
            0,
            Arc::new(move |ctx: &mut GcContext<'_>| {
                ctx.reset_tlabs();
                collector_belts.belt(0).reset_allocation_mark();
            }),
        );
        (Heap::new(config, scheme).unwrap(), belts)
    }

    fn small_config() -> Config {
        Config {
            max_heap_size: 1024 * 1024,
            initial_heap_size: 1024 * 1024,
            tlab_size: 4096,
            ..Config::default()
        }
    }

    #[test]
    fn first_allocation_refills_tlab() {
        let (heap, belts) = heap(small_config());
        let mut mutator = heap.attach_mutator();
        let cell = mutator.allocate_raw(64);
        assert_eq!(cell, belts.belt(0).start());
        let extent = mutator.local_heap().tlab_extent();
        assert_eq!(extent.start, belts.belt(0).start());
        assert_eq!(extent.size, 4096);
        assert_eq!(belts.used_memory(), 4096);
        let next = mutator.allocate_raw(10);
        assert_eq!(next, unsafe { cell.add(64) });
        assert_eq!(heap.tlab_stats().slow_path_allocations(), 1);
    }

    #[test]
    fn exhausted_tlab_is_filled_and_replaced() {
        let (heap, belts) = heap(small_config());
        let mut mutator = heap.attach_mutator();
        let first = mutator.allocate_raw(4000);
        assert!(!first.is_null());
        let second = mutator.allocate_raw(200);
        assert_eq!(second, unsafe { belts.belt(0).start().add(4096) });
        let filler = CellHeader::load(unsafe { first.add(4000) });
        assert_eq!(filler.kind(), CellKind::Filler);
        assert_eq!(filler.size(), 96);
        assert_eq!(heap.tlab_stats().refills(), 1);
    }

    #[test]
    fn large_request_bypasses_tlab() {
        let (heap, belts) = heap(small_config());
        let mut mutator = heap.attach_mutator();
        let small = mutator.allocate_raw(8);
        let large = mutator.allocate_raw(8192);
        assert_eq!(large, unsafe { belts.belt(0).start().add(4096) });
        // the TLAB is still in use
        assert_eq!(mutator.allocate_raw(8), unsafe { small.add(8) });
        assert_eq!(heap.tlab_stats().overflows(), 1);
    }

    #[test]
    fn exhaustion_collects_and_retries() {
        let (heap, belts) = heap(small_config());
        let mut mutator = heap.attach_mutator();
        let mut allocated = 0;
        while allocated < 2 * 1024 * 1024 {
            assert!(!mutator.allocate_raw(1024).is_null());
            allocated += 1024;
        }
        assert!(heap.invocation_count() >= 1);
        assert!(belts.used_memory() <= 1024 * 1024);
    }

    #[test]
    fn objects_are_planted() {
        let (heap, _) = heap(small_config());
        let mut mutator = heap.attach_mutator();
        let array_hub = TestHub {
            id: 3,
            tuple_size: 0,
            kind: Some(ComponentKind::Int),
            finalizer: false,
        };
        let array = mutator.create_array(&array_hub, 5);
        assert_eq!(unsafe { CellLayout::length(array) }, 5);
        assert_eq!(CellHeader::load(array).kind(), CellKind::Array);

        let tuple_hub = TestHub::tuple(4, 2);
        let tuple = mutator.create_tuple(&tuple_hub);
        assert_eq!(CellHeader::load(tuple).size(), tuple_hub.tuple_size);

        let copy = unsafe { mutator.clone(tuple) };
        assert_ne!(copy, tuple);
        assert_eq!(CellHeader::load(copy).hub_id(), 4);

        let hybrid = mutator.create_hybrid(&TestHub::tuple(5, 3));
        let expanded = unsafe { mutator.expand_hybrid(hybrid, 8) };
        assert_eq!(unsafe { CellLayout::length(expanded) }, 8);
        assert_eq!(CellHeader::load(expanded).hub_id(), 5);

        let finalizable = TestHub {
            finalizer: true,
            ..TestHub::tuple(6, 1)
        };
        mutator.create_tuple(&finalizable);
        assert_eq!(heap.references().finalizee_count(), 1);
    }

    #[test]
    fn fieldless_hybrid_gets_a_length_word() {
        let (heap, _) = heap(small_config());
        let mut mutator = heap.attach_mutator();
        let hybrid = mutator.create_hybrid(&TestHub::tuple(8, 0));
        assert!(!hybrid.is_null());
        assert_eq!(CellHeader::load(hybrid).kind(), CellKind::Hybrid);
        assert_eq!(CellHeader::load(hybrid).size(), CellLayout::ARRAY_HEADER_SIZE);
        assert_eq!(unsafe { CellLayout::length(hybrid) }, 0);

        let expanded = unsafe { mutator.expand_hybrid(hybrid, 2) };
        assert_eq!(unsafe { CellLayout::length(expanded) }, 2);
        assert_eq!(CellHeader::load(expanded).hub_id(), 8);
    }

    #[test]
    fn immortal_mode_routes_to_immortal_region() {
        let (heap, belts) = heap(small_config());
        let mut mutator = heap.attach_mutator();
        let before = mutator.allocate_raw(16);
        mutator.enable_immortal_allocation();
        let immortal = mutator.allocate_raw(32);
        assert!(heap.immortal().contains(immortal));
        assert!(!belts.contains(immortal));
        assert!(heap.is_valid_ref(immortal));
        mutator.disable_immortal_allocation();
        assert_eq!(mutator.allocate_raw(16), unsafe { before.add(16) });
    }

    #[test]
    fn nested_disable_restores_fast_path() {
        let (heap, _) = heap(small_config());
        let mut mutator = heap.attach_mutator();
        let first = mutator.allocate_raw(16);
        mutator.disable_allocation();
        mutator.disable_allocation();
        mutator.enable_allocation();
        assert!(mutator.is_allocation_disabled());
        mutator.enable_allocation();
        assert!(!mutator.is_allocation_disabled());
        assert_eq!(mutator.allocate_raw(16), unsafe { first.add(16) });
    }

    #[test]
    fn spawned_mutators_detach() {
        let (heap, _) = heap(small_config());
        let mutator = heap.attach_mutator();
        let handle = mutator
            .spawn("worker", |worker| {
                let cell = worker.allocate_raw(32);
                !cell.is_null()
            })
            .unwrap();
        let allocated = mutator.parked(|| handle.join().unwrap());
        assert!(allocated);
        assert_eq!(heap.safepoint().number_of_local_heaps(), 1);
    }
}
