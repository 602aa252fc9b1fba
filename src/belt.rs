//! Belts: bump-pointer regions with a lock-free allocation mark.
//!
//! A belt is a contiguous slice of the heap reservation. Mutators and collector threads carve
//! cells out of it by advancing `allocation_mark` with a compare-and-swap. The mark only moves
//! forward between two resets, and resets only happen while the world is stopped.
//!
//! The usable window of a belt may start above the belt's physical start. Once the mark wraps
//! back to the start of the belt (ring reuse by a generational collector) the window is
//! `[usable_start, stop)` followed by `[start, mark)` and allocation is bounded by
//! `usable_start` until the belt is reset. A wrapped mark may reach `usable_start` exactly,
//! which is a full ring and not an empty window.

use std::{
    ptr::null_mut,
    sync::atomic::{AtomicBool, AtomicPtr, Ordering},
};

use crossbeam_utils::{Backoff, CachePadded};

use crate::{
    error::{ConfigError, HeapError, HeapResult},
    layout::DEBUG_TAG,
    mmap::Mmap,
    util::{align_down, align_up, distance},
    Config, WORD_SIZE,
};

/// Granule by which an expandable belt grows its stop address.
pub const EXPANSION_GRANULE: usize = 64 * 1024;

pub struct Belt {
    index: usize,
    start: *mut u8,
    stop: AtomicPtr<u8>,
    /// Highest address an expandable belt may grow to.
    limit: *mut u8,
    usable_start: AtomicPtr<u8>,
    /// Set while the mark runs in `[start, usable_start]` after a wrap.
    wrapped: AtomicBool,
    expandable: bool,
    frame_percentage: usize,
    allocation_mark: CachePadded<AtomicPtr<u8>>,
    previous_allocation_mark: AtomicPtr<u8>,
    tagging: bool,
}

unsafe impl Send for Belt {}
unsafe impl Sync for Belt {}

impl Belt {
    /// Creates a belt over `[start, stop)`. An expandable belt may later grow up to `limit`.
    ///
    /// # Safety
    /// `[start, limit)` must be writable memory that outlives the belt and is not handed out
    /// by anything else.
    pub unsafe fn new(
        index: usize,
        start: *mut u8,
        stop: *mut u8,
        limit: *mut u8,
        expandable: bool,
        frame_percentage: usize,
        tagging: bool,
    ) -> Self {
        debug_assert!(start <= stop && stop <= limit);
        Self {
            index,
            start,
            stop: AtomicPtr::new(stop),
            limit,
            usable_start: AtomicPtr::new(start),
            wrapped: AtomicBool::new(false),
            expandable,
            frame_percentage,
            allocation_mark: CachePadded::new(AtomicPtr::new(start)),
            previous_allocation_mark: AtomicPtr::new(start),
            tagging,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }
    pub fn start(&self) -> *mut u8 {
        self.start
    }
    pub fn stop(&self) -> *mut u8 {
        self.stop.load(Ordering::Acquire)
    }
    pub fn limit(&self) -> *mut u8 {
        self.limit
    }
    pub fn size(&self) -> usize {
        distance(self.start, self.stop())
    }
    pub fn is_expandable(&self) -> bool {
        self.expandable
    }
    pub fn frame_percentage(&self) -> usize {
        self.frame_percentage
    }
    pub fn usable_start(&self) -> *mut u8 {
        self.usable_start.load(Ordering::Acquire)
    }
    pub fn allocation_mark(&self) -> *mut u8 {
        self.allocation_mark.load(Ordering::Acquire)
    }
    pub fn previous_allocation_mark(&self) -> *mut u8 {
        self.previous_allocation_mark.load(Ordering::Relaxed)
    }

    pub fn contains(&self, addr: *const u8) -> bool {
        addr >= self.start as *const u8 && addr < self.stop() as *const u8
    }

    /// True from [Belt::wrap_allocation_mark] until the next reset.
    pub fn is_wrapped(&self) -> bool {
        self.wrapped.load(Ordering::Acquire)
    }

    #[inline(always)]
    fn bound(&self) -> *mut u8 {
        if self.is_wrapped() {
            self.usable_start()
        } else {
            self.stop()
        }
    }

    #[inline(always)]
    fn cell_and_end(mark: *mut u8, size: usize, tag: bool) -> (usize, usize) {
        let cell = mark as usize + if tag { WORD_SIZE } else { 0 };
        (cell, cell + size)
    }

    /// Grows `stop` so that `end` fits. Only an expandable belt that has not wrapped can
    /// grow, and never past `limit`.
    fn try_expand(&self, end: usize) -> bool {
        if !self.expandable || self.is_wrapped() || end > self.limit as usize {
            return false;
        }
        let grown = align_up(end - self.start as usize, EXPANSION_GRANULE);
        let new_stop = (self.start as usize + grown).min(self.limit as usize) as *mut u8;
        let _ = self
            .stop
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |stop| {
                if stop < new_stop {
                    Some(new_stop)
                } else {
                    None
                }
            });
        true
    }

    /// Bump allocates a cell of `size` bytes, preceded by a debug tag in tagging mode. Returns
    /// null when the belt is full; that is an ordinary outcome and the caller escalates.
    #[inline]
    pub fn allocate(&self, size: usize) -> *mut u8 {
        self.bump(size, self.tagging)
    }

    /// Bump allocates `size` raw bytes for a TLAB. Cells carved out of the chunk get their
    /// tags from the TLAB, the chunk itself is never tagged.
    #[inline]
    pub fn allocate_chunk(&self, size: usize) -> *mut u8 {
        self.bump(size, false)
    }

    #[inline(always)]
    fn bump(&self, size: usize, tag: bool) -> *mut u8 {
        let mut old = self.allocation_mark.load(Ordering::Relaxed);
        let (cell, end) = Self::cell_and_end(old, size, tag);
        if end <= self.bound() as usize {
            if self
                .allocation_mark
                .compare_exchange_weak(old, end as *mut u8, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return self.finish(old, cell, tag);
            }
            old = self.allocation_mark.load(Ordering::Relaxed);
        }
        self.bump_slow(old, size, tag)
    }

    #[cold]
    #[inline(never)]
    fn bump_slow(&self, mut old: *mut u8, size: usize, tag: bool) -> *mut u8 {
        let backoff = Backoff::new();
        loop {
            let (cell, end) = Self::cell_and_end(old, size, tag);
            if end > self.bound() as usize && !self.try_expand(end) {
                return null_mut();
            }
            match self.allocation_mark.compare_exchange_weak(
                old,
                end as *mut u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return self.finish(old, cell, tag),
                Err(current) => {
                    old = current;
                    backoff.spin();
                }
            }
        }
    }

    #[inline(always)]
    fn finish(&self, old: *mut u8, cell: usize, tag: bool) -> *mut u8 {
        self.previous_allocation_mark.store(old, Ordering::Relaxed);
        if tag {
            unsafe { old.cast::<usize>().write(DEBUG_TAG) };
        }
        cell as *mut u8
    }

    /// Allocation on behalf of the collector while the world is stopped. Running out of space
    /// here means the collector cannot complete, which is fatal.
    pub fn gc_allocate(&self, size: usize) -> *mut u8 {
        let cell = self.allocate(size);
        if cell.is_null() {
            crate::fatal!(
                "belt {} cannot satisfy collector allocation of {} bytes (mark {:p}, stop {:p})",
                self.index,
                size,
                self.allocation_mark(),
                self.stop()
            );
        }
        cell
    }

    /// Single threaded variant of [Belt::gc_allocate] for a collector that owns the belt.
    ///
    /// # Safety
    /// No other thread may allocate in this belt concurrently.
    pub unsafe fn gc_bump_allocate(&self, size: usize) -> *mut u8 {
        let old = self.allocation_mark.load(Ordering::Relaxed);
        let (cell, end) = Self::cell_and_end(old, size, self.tagging);
        if end > self.bound() as usize && !self.try_expand(end) {
            crate::fatal!(
                "belt {} cannot satisfy collector allocation of {} bytes",
                self.index,
                size
            );
        }
        self.allocation_mark.store(end as *mut u8, Ordering::Release);
        self.finish(old, cell, self.tagging)
    }

    /// Empties the belt. Only valid while no thread can allocate in it.
    pub fn reset_allocation_mark(&self) {
        self.allocation_mark.store(self.start, Ordering::Release);
        self.previous_allocation_mark
            .store(self.start, Ordering::Relaxed);
        self.usable_start.store(self.start, Ordering::Release);
        self.wrapped.store(false, Ordering::Release);
    }

    /// Wraps the mark back to the start of the belt, keeping `[usable_start, stop)` live.
    /// Only valid while no thread can allocate in it.
    pub fn wrap_allocation_mark(&self) {
        self.previous_allocation_mark
            .store(self.allocation_mark(), Ordering::Relaxed);
        self.allocation_mark.store(self.start, Ordering::Release);
        self.wrapped.store(true, Ordering::Release);
    }

    /// Moves the start of the usable window. On a wrapped belt the new start must not fall below
    /// the mark. Only valid while no thread can allocate in it.
    pub fn set_usable_start(&self, usable_start: *mut u8) {
        debug_assert!(usable_start >= self.start && usable_start <= self.stop());
        debug_assert!(!self.is_wrapped() || usable_start >= self.allocation_mark());
        self.usable_start.store(usable_start, Ordering::Release);
    }

    /// Bytes between the usable start and the mark, following the mark around the ring once it
    /// has wrapped.
    pub fn used_memory(&self) -> usize {
        let mark = self.allocation_mark();
        let usable_start = self.usable_start();
        if self.is_wrapped() {
            distance(usable_start, self.stop()) + distance(self.start, mark)
        } else {
            distance(usable_start, mark)
        }
    }

    pub fn free_memory(&self) -> usize {
        self.size() - self.used_memory()
    }
}

impl std::fmt::Debug for Belt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Belt")
            .field("index", &self.index)
            .field("start", &self.start)
            .field("stop", &self.stop())
            .field("mark", &self.allocation_mark())
            .field("expandable", &self.expandable)
            .finish()
    }
}

/// Shape of one belt: its share of the initial heap and whether it may grow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BeltSpec {
    pub frame_percentage: usize,
    pub expandable: bool,
}

impl BeltSpec {
    pub const fn new(frame_percentage: usize, expandable: bool) -> Self {
        Self {
            frame_percentage,
            expandable,
        }
    }
}

/// Owns the heap reservation and the belts laid out in it, oldest belt first.
pub struct BeltManager {
    memory: Mmap,
    belts: Vec<Belt>,
}

impl BeltManager {
    /// Reserves `max_heap_size` bytes and lays the belts out consecutively inside the first
    /// `initial_heap_size` bytes, each one getting its frame percentage. The last belt may grow
    /// into the rest of the reservation when it is expandable.
    pub fn new(config: &Config, specs: &[BeltSpec]) -> HeapResult<Self> {
        config.validate()?;
        let total: usize = specs.iter().map(|spec| spec.frame_percentage).sum();
        if specs.is_empty() || total > 100 {
            return Err(ConfigError::BadBeltLayout(total).into());
        }
        let memory = Mmap::new(config.max_heap_size).map_err(|source| HeapError::Reservation {
            size: config.max_heap_size,
            source,
        })?;

        let mut belts = Vec::with_capacity(specs.len());
        let mut cursor = memory.start();
        for (index, spec) in specs.iter().enumerate() {
            let size = align_down(
                config.initial_heap_size * spec.frame_percentage / 100,
                WORD_SIZE,
            );
            if size == 0 {
                return Err(ConfigError::BadBeltLayout(total).into());
            }
            let stop = unsafe { cursor.add(size) };
            let limit = if index + 1 == specs.len() {
                memory.end()
            } else {
                stop
            };
            let belt = unsafe {
                Belt::new(
                    index,
                    cursor,
                    stop,
                    limit,
                    spec.expandable,
                    spec.frame_percentage,
                    config.debug_tagging,
                )
            };
            log::debug!(target: "gc", "{:?}", belt);
            belts.push(belt);
            cursor = stop;
        }
        Ok(Self { memory, belts })
    }

    pub fn belt(&self, index: usize) -> &Belt {
        &self.belts[index]
    }

    pub fn belts(&self) -> &[Belt] {
        &self.belts
    }

    pub fn belt_containing(&self, addr: *const u8) -> Option<&Belt> {
        self.belts.iter().find(|belt| belt.contains(addr))
    }

    pub fn contains(&self, addr: *const u8) -> bool {
        self.memory.contains(addr) && self.belt_containing(addr).is_some()
    }

    pub fn used_memory(&self) -> usize {
        self.belts.iter().map(Belt::used_memory).sum()
    }

    pub fn free_memory(&self) -> usize {
        self.belts.iter().map(Belt::free_memory).sum()
    }

    pub fn reserved_size(&self) -> usize {
        self.memory.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn standalone(memory: &Mmap, size: usize, expandable: bool, tagging: bool) -> Belt {
        unsafe {
            let stop = memory.start().add(size);
            let limit = if expandable { memory.end() } else { stop };
            Belt::new(0, memory.start(), stop, limit, expandable, 100, tagging)
        }
    }

    #[test]
    fn fills_1024_byte_belt() {
        let memory = Mmap::new(4096).unwrap();
        let belt = standalone(&memory, 1024, false, false);
        let mut cells = HashSet::new();
        for i in 0..10 {
            let cell = belt.allocate(100);
            assert_eq!(cell as usize, memory.start() as usize + i * 100);
            assert!(belt.contains(cell));
            assert!(cells.insert(cell as usize));
        }
        assert_eq!(belt.used_memory(), 1000);
        // 1000 + 100 does not fit in 1024 bytes
        assert!(belt.allocate(100).is_null());
        assert_eq!(belt.allocation_mark() as usize, memory.start() as usize + 1000);
    }

    #[test]
    fn reset_empties_belt() {
        let memory = Mmap::new(4096).unwrap();
        let belt = standalone(&memory, 1024, false, false);
        assert!(!belt.allocate(1000).is_null());
        assert!(belt.allocate(100).is_null());
        belt.reset_allocation_mark();
        assert_eq!(belt.allocation_mark(), belt.start());
        assert_eq!(belt.allocate(100), belt.start());
    }

    #[test]
    fn tagged_cells_follow_their_tag() {
        let memory = Mmap::new(4096).unwrap();
        let belt = standalone(&memory, 1024, false, true);
        let cell = belt.allocate(16);
        assert_eq!(cell, unsafe { belt.start().add(WORD_SIZE) });
        assert!(unsafe { crate::layout::has_debug_tag(cell) });
        assert_eq!(belt.used_memory(), 16 + WORD_SIZE);

        let chunk = belt.allocate_chunk(256);
        assert_eq!(chunk, unsafe { cell.add(16) });
        assert_eq!(belt.used_memory(), 16 + WORD_SIZE + 256);
    }

    #[test]
    fn expandable_belt_grows_to_its_limit() {
        let memory = Mmap::new(4 * EXPANSION_GRANULE).unwrap();
        let belt = standalone(&memory, 1024, true, false);
        let cell = belt.allocate(2048);
        assert_eq!(cell, belt.start());
        assert_eq!(belt.size(), EXPANSION_GRANULE);
        assert!(belt.allocate(4 * EXPANSION_GRANULE).is_null());
        assert!(!belt.gc_allocate(EXPANSION_GRANULE).is_null());
        assert_eq!(belt.stop(), unsafe { belt.start().add(2 * EXPANSION_GRANULE) });
    }

    #[test]
    fn wrapped_belt_accounts_both_segments() {
        let memory = Mmap::new(4096).unwrap();
        let belt = standalone(&memory, 1024, false, false);
        assert!(!belt.allocate(1000).is_null());
        let usable = unsafe { belt.start().add(600) };
        belt.set_usable_start(usable);
        assert_eq!(belt.used_memory(), 400);
        belt.wrap_allocation_mark();
        assert!(belt.is_wrapped());
        assert!(!belt.allocate(200).is_null());
        assert_eq!(belt.used_memory(), (1024 - 600) + 200);
        assert_eq!(belt.free_memory(), 1024 - belt.used_memory());
        // wrapped allocation stops at the usable start
        assert!(belt.allocate(500).is_null());
        assert!(!belt.allocate(400).is_null());
    }

    #[test]
    fn exactly_full_ring_stays_full() {
        let memory = Mmap::new(4096).unwrap();
        let belt = standalone(&memory, 1024, false, false);
        assert!(!belt.allocate(1000).is_null());
        let usable = unsafe { belt.start().add(600) };
        belt.set_usable_start(usable);
        belt.wrap_allocation_mark();

        assert_eq!(belt.allocate(600), belt.start());
        assert_eq!(belt.allocation_mark(), usable);
        assert!(belt.is_wrapped());
        assert_eq!(belt.used_memory(), 1024);
        assert_eq!(belt.free_memory(), 0);
        // the live tail starting at the usable start is never handed out again
        assert!(belt.allocate(100).is_null());
        assert!(belt.allocate(8).is_null());

        belt.reset_allocation_mark();
        assert!(!belt.is_wrapped());
        assert_eq!(belt.used_memory(), 0);
        assert_eq!(belt.allocate(100), belt.start());
    }

    #[test]
    fn mark_never_moves_backwards() {
        let memory = Mmap::new(1024 * 1024).unwrap();
        let belt = standalone(&memory, 1024 * 1024, false, false);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let mut last = belt.allocation_mark();
                    for _ in 0..1000 {
                        belt.allocate(24);
                        let mark = belt.allocation_mark();
                        assert!(mark >= last);
                        last = mark;
                    }
                });
            }
        });
    }

    #[test]
    fn manager_lays_belts_out_by_percentage() {
        let config = Config {
            max_heap_size: 8 * 1024 * 1024,
            initial_heap_size: 4 * 1024 * 1024,
            ..Config::default()
        };
        let manager =
            BeltManager::new(&config, &[BeltSpec::new(25, false), BeltSpec::new(75, true)])
                .unwrap();
        assert_eq!(manager.belt(0).size(), 1024 * 1024);
        assert_eq!(manager.belt(1).size(), 3 * 1024 * 1024);
        assert_eq!(manager.belt(0).stop(), manager.belt(1).start());
        assert_eq!(manager.belt(1).limit(), unsafe {
            manager.belt(0).start().add(8 * 1024 * 1024)
        });
        let cell = manager.belt(1).allocate(64);
        assert!(manager.contains(cell));
        assert_eq!(manager.belt_containing(cell).map(Belt::index), Some(1));
        assert_eq!(manager.used_memory(), 64);

        assert!(matches!(
            BeltManager::new(&config, &[BeltSpec::new(60, false), BeltSpec::new(60, true)]),
            Err(HeapError::Config(ConfigError::BadBeltLayout(120)))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn concurrent_cells_never_overlap(
            sizes in prop::collection::vec(1usize..64, 1..64),
            threads in 1usize..5,
        ) {
            let memory = Mmap::new(64 * 1024).unwrap();
            let belt = standalone(&memory, 32 * 1024, false, false);
            let cells: Vec<(usize, usize)> = std::thread::scope(|s| {
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let sizes = &sizes;
                        let belt = &belt;
                        s.spawn(move || {
                            sizes
                                .iter()
                                .filter_map(|words| {
                                    let size = words * WORD_SIZE;
                                    let cell = belt.allocate(size);
                                    (!cell.is_null()).then(|| (cell as usize, size))
                                })
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect();
                handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
            });

            let mut sorted = cells.clone();
            sorted.sort_unstable();
            for pair in sorted.windows(2) {
                prop_assert!(pair[0].0 + pair[0].1 <= pair[1].0);
            }
            let starts: HashSet<_> = cells.iter().map(|c| c.0).collect();
            prop_assert_eq!(starts.len(), cells.len());
            for (cell, size) in cells {
                prop_assert!(cell >= belt.start() as usize);
                prop_assert!(cell + size <= belt.stop() as usize);
            }
        }
    }
}
