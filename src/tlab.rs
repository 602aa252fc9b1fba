//! Thread local allocation buffers.
//!
//! A TLAB is a slice of a belt owned by one mutator. Its mark is bumped without any atomics:
//! only the owning thread touches it, except while the world is stopped. The last
//! [Tlab::headroom] bytes of a TLAB are never handed out so that the unused tail can always be
//! covered by a filler cell, which keeps the belt walkable.

use std::{
    ptr::null_mut,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    layout::{adjust_for_debug_tag, ObjectLayout},
    util::distance,
    WORD_SIZE,
};

pub struct Tlab {
    start: *mut u8,
    size: usize,
    mark: *mut u8,
    /// Allocation must not move the mark past this point.
    end_allocation_mark: *mut u8,
    top: *mut u8,
    previous_allocation_mark: *mut u8,
    /// Link used by [TlabChain]. The chain never owns the TLAB.
    next_tlab: *mut Tlab,
    scavenged: AtomicBool,
    tagging: bool,
}

/// Where a TLAB lives and how far it is used. Lets a TLAB be put aside and reinstated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlabExtent {
    pub start: *mut u8,
    pub mark: *mut u8,
    pub size: usize,
}

impl Tlab {
    /// Bytes reserved at the end of every TLAB for the filler cell.
    pub const fn headroom(tagging: bool) -> usize {
        2 * WORD_SIZE + if tagging { WORD_SIZE } else { 0 }
    }

    pub const fn new(tagging: bool) -> Self {
        Self {
            start: null_mut(),
            size: 0,
            mark: null_mut(),
            end_allocation_mark: null_mut(),
            top: null_mut(),
            previous_allocation_mark: null_mut(),
            next_tlab: null_mut(),
            scavenged: AtomicBool::new(false),
            tagging,
        }
    }

    /// Points the TLAB at `[start, start + size)` with allocation continuing at `mark`.
    ///
    /// # Safety
    /// The range must be writable and owned by the calling thread from now on.
    pub unsafe fn initialize(&mut self, start: *mut u8, mark: *mut u8, size: usize) {
        debug_assert!(size >= Self::headroom(self.tagging));
        debug_assert!(mark >= start && mark <= start.add(size));
        self.start = start;
        self.size = size;
        self.mark = mark;
        self.previous_allocation_mark = mark;
        self.top = start.add(size);
        self.end_allocation_mark = self.top.sub(Self::headroom(self.tagging));
        self.scavenged.store(false, Ordering::Release);
    }

    pub fn unset(&mut self) {
        self.start = null_mut();
        self.size = 0;
        self.mark = null_mut();
        self.previous_allocation_mark = null_mut();
        self.top = null_mut();
        self.end_allocation_mark = null_mut();
    }

    pub fn is_tagging(&self) -> bool {
        self.tagging
    }

    pub fn is_set(&self) -> bool {
        !self.start.is_null()
    }

    pub fn start(&self) -> *mut u8 {
        self.start
    }
    pub fn size(&self) -> usize {
        self.size
    }
    pub fn mark(&self) -> *mut u8 {
        self.mark
    }
    pub fn top(&self) -> *mut u8 {
        self.top
    }
    pub fn end_allocation_mark(&self) -> *mut u8 {
        self.end_allocation_mark
    }

    pub fn extent(&self) -> TlabExtent {
        TlabExtent {
            start: self.start,
            mark: self.mark,
            size: self.size,
        }
    }

    /// Bytes between the mark and the top.
    pub fn leftover(&self) -> usize {
        if self.is_set() {
            distance(self.mark, self.top)
        } else {
            0
        }
    }

    /// Bump allocates `size` bytes. On overflow the unused tail is covered with a filler and
    /// null is returned; the owner then decides whether to refill.
    #[inline(always)]
    pub fn allocate(&mut self, size: usize, layout: &dyn ObjectLayout) -> *mut u8 {
        let mark = self.mark;
        let cell = mark as usize + if self.tagging { WORD_SIZE } else { 0 };
        let end = cell + size;
        if end > self.end_allocation_mark as usize {
            self.overflow(layout);
            return null_mut();
        }
        self.previous_allocation_mark = mark;
        self.mark = end as *mut u8;
        unsafe { adjust_for_debug_tag(mark, self.tagging) }
    }

    #[cold]
    #[inline(never)]
    fn overflow(&mut self, layout: &dyn ObjectLayout) {
        if self.is_set() && !self.end_allocation_mark.is_null() {
            self.fill_tlab(layout);
        }
    }

    /// Backs out of the last allocation.
    pub fn undo_last_allocation(&mut self) {
        self.mark = self.previous_allocation_mark;
    }

    /// Covers `[mark, top)` with a filler cell. The mark is left where it is.
    pub fn fill_tlab(&mut self, layout: &dyn ObjectLayout) {
        if !self.is_set() {
            return;
        }
        unsafe {
            let cell = adjust_for_debug_tag(self.mark, self.tagging);
            layout.fill_region(cell, self.top);
        }
    }

    /// Takes the allocation bound away so the fast path always fails. Returns the bound for
    /// [Tlab::restore_end_allocation_mark].
    pub fn take_end_allocation_mark(&mut self) -> *mut u8 {
        std::mem::replace(&mut self.end_allocation_mark, null_mut())
    }

    pub fn restore_end_allocation_mark(&mut self, end: *mut u8) {
        self.end_allocation_mark = end;
    }

    pub fn is_scavenged(&self) -> bool {
        self.scavenged.load(Ordering::Acquire)
    }

    /// Claims the TLAB for one collector thread. Only the first caller after an
    /// [initialize](Tlab::initialize) gets `true`.
    pub fn try_claim(&self) -> bool {
        self.scavenged
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn next_tlab(&self) -> *mut Tlab {
        self.next_tlab
    }
}

/// Intrusive list of the TLABs of all mutators, built by the collector while the world is
/// stopped.
pub struct TlabChain {
    head: *mut Tlab,
    len: usize,
}

unsafe impl Send for TlabChain {}
unsafe impl Sync for TlabChain {}

impl Default for TlabChain {
    fn default() -> Self {
        Self::new()
    }
}

impl TlabChain {
    pub const fn new() -> Self {
        Self {
            head: null_mut(),
            len: 0,
        }
    }

    /// # Safety
    /// `tlab` must stay valid and unmoved for as long as the chain is used.
    pub unsafe fn push(&mut self, tlab: *mut Tlab) {
        (*tlab).next_tlab = self.head;
        self.head = tlab;
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tlab> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || unsafe {
            let tlab = cursor.as_ref()?;
            cursor = tlab.next_tlab;
            Some(tlab)
        })
    }

    /// Runs `f` on every TLAB no other thread has claimed yet. Several collector threads may
    /// walk the same chain; each TLAB is handed to exactly one of them.
    pub fn for_each_unscavenged(&self, mut f: impl FnMut(&Tlab)) {
        for tlab in self.iter() {
            if tlab.try_claim() {
                f(tlab);
            }
        }
    }

    /// Unlinks every TLAB.
    pub fn clear(&mut self) {
        let mut cursor = self.head;
        while let Some(tlab) = unsafe { cursor.as_mut() } {
            cursor = std::mem::replace(&mut tlab.next_tlab, null_mut());
        }
        self.head = null_mut();
        self.len = 0;
    }
}

impl Drop for TlabChain {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{tests::TestHub, CellKind, CellLayout, Hub};
    use std::sync::atomic::AtomicUsize;

    fn buffer(words: usize) -> Vec<usize> {
        vec![0usize; words]
    }

    #[test]
    fn overflow_fills_and_refill_succeeds() {
        let mut first = buffer(32);
        let mut second = buffer(32);
        let mut tlab = Tlab::new(false);
        unsafe {
            let start = first.as_mut_ptr().cast::<u8>();
            tlab.initialize(start, start, 256);
            assert_eq!(tlab.end_allocation_mark(), start.add(240));

            let cell = tlab.allocate(200, &CellLayout);
            assert_eq!(cell, start);
            assert!(tlab.allocate(100, &CellLayout).is_null());
            assert_eq!(tlab.mark(), start.add(200));
            let filler = crate::layout::CellHeader::load(start.add(200));
            assert_eq!(filler.kind(), CellKind::Filler);
            assert_eq!(filler.size(), 56);

            let fresh = second.as_mut_ptr().cast::<u8>();
            tlab.initialize(fresh, fresh, 256);
            assert_eq!(tlab.allocate(100, &CellLayout), fresh);
        }
    }

    #[test]
    fn reinitialized_tlab_allocates_from_start() {
        let mut memory = buffer(64);
        let mut tlab = Tlab::new(true);
        unsafe {
            let start = memory.as_mut_ptr().cast::<u8>();
            tlab.initialize(start, start, 512);
            assert!(!tlab.allocate(64, &CellLayout).is_null());
            tlab.fill_tlab(&CellLayout);
            tlab.initialize(start, start, 512);
            let cell = tlab.allocate(64, &CellLayout);
            assert_eq!(cell, start.add(WORD_SIZE));
            assert!(crate::layout::has_debug_tag(cell));
        }
    }

    #[test]
    fn filled_tlab_is_walkable() {
        let mut memory = buffer(128);
        let hub = TestHub::tuple(4, 3);
        let mut tlab = Tlab::new(false);
        unsafe {
            let start = memory.as_mut_ptr().cast::<u8>();
            tlab.initialize(start, start, 1024);
            let mut objects = 0;
            loop {
                let cell = tlab.allocate(hub.tuple_size(), &CellLayout);
                if cell.is_null() {
                    break;
                }
                CellLayout.plant_tuple(cell, &hub);
                objects += 1;
            }
            let mut seen = 0;
            let mut covered = 0;
            CellLayout::walk(start, tlab.top(), |_, header| {
                covered += header.size();
                if header.kind() == CellKind::Tuple {
                    seen += 1;
                }
            });
            assert_eq!(seen, objects);
            assert_eq!(covered, 1024);
        }
    }

    #[test]
    fn undo_rewinds_last_allocation() {
        let mut memory = buffer(32);
        let mut tlab = Tlab::new(false);
        unsafe {
            let start = memory.as_mut_ptr().cast::<u8>();
            tlab.initialize(start, start, 256);
            tlab.allocate(16, &CellLayout);
            let second = tlab.allocate(32, &CellLayout);
            tlab.undo_last_allocation();
            assert_eq!(tlab.mark(), second);
            assert_eq!(tlab.allocate(32, &CellLayout), second);
        }
    }

    #[test]
    fn unset_tlab_never_allocates() {
        let mut tlab = Tlab::new(false);
        assert!(tlab.allocate(8, &CellLayout).is_null());
        assert_eq!(tlab.leftover(), 0);
    }

    #[test]
    fn taken_bound_forces_slow_path() {
        let mut memory = buffer(32);
        let mut tlab = Tlab::new(false);
        unsafe {
            let start = memory.as_mut_ptr().cast::<u8>();
            tlab.initialize(start, start, 256);
            let end = tlab.take_end_allocation_mark();
            assert!(tlab.allocate(8, &CellLayout).is_null());
            tlab.restore_end_allocation_mark(end);
            assert_eq!(tlab.allocate(8, &CellLayout), start);
        }
    }

    #[test]
    fn chain_hands_each_tlab_to_one_scavenger() {
        let mut memory = buffer(8 * 32);
        let mut tlabs: Vec<Tlab> = (0..8).map(|_| Tlab::new(false)).collect();
        let mut chain = TlabChain::new();
        unsafe {
            for (i, tlab) in tlabs.iter_mut().enumerate() {
                let start = memory.as_mut_ptr().add(i * 32).cast::<u8>();
                tlab.initialize(start, start, 256);
                chain.push(tlab);
            }
        }
        assert_eq!(chain.len(), 8);
        let claimed = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    chain.for_each_unscavenged(|_| {
                        claimed.fetch_add(1, Ordering::Relaxed);
                    })
                });
            }
        });
        assert_eq!(claimed.load(Ordering::Relaxed), 8);
        assert!(chain.iter().all(Tlab::is_scavenged));
        chain.clear();
        assert!(tlabs.iter().all(|tlab| tlab.next_tlab().is_null()));
    }
}
