//! Decides what happens when a TLAB cannot satisfy a request: refill it, or leave it alone and
//! allocate the request directly in a belt.
//!
//! Every thread gets its policy on its first TLAB overflow. The policy also keeps the TLAB bound
//! while allocation is disabled on the thread, see
//! [LocalHeap::disable_allocation](crate::local_heap::LocalHeap::disable_allocation).

use std::ptr::null_mut;

/// Consecutive failures at the same mark after which a refill is forced.
pub const ALLOCATION_FAILURE_TOLERANCE: usize = 3;

pub trait TlabRefillPolicy: Send {
    /// Should the TLAB whose mark is `mark` be refilled because `size` bytes did not fit?
    /// A null `mark` means the thread has no TLAB.
    fn should_refill(&mut self, size: usize, mark: *mut u8) -> bool;

    /// Size of the next TLAB. Zero when TLABs are not used at all.
    fn next_tlab_size(&self) -> usize;

    fn save_tlab_top(&mut self, top: *mut u8);

    fn saved_tlab_top(&self) -> *mut u8;
}

/// Refills for small requests and for large requests that keep failing at the same mark.
pub struct SimpleTlabRefillPolicy {
    next_size: usize,
    refill_threshold: usize,
    allocation_failures: usize,
    last_mark: *mut u8,
    saved_top: *mut u8,
}

unsafe impl Send for SimpleTlabRefillPolicy {}

impl SimpleTlabRefillPolicy {
    pub fn new(tlab_size: usize, refill_threshold_percent: usize) -> Self {
        Self {
            next_size: tlab_size,
            refill_threshold: tlab_size * refill_threshold_percent / 100,
            allocation_failures: 0,
            last_mark: null_mut(),
            saved_top: null_mut(),
        }
    }

    pub fn refill_threshold(&self) -> usize {
        self.refill_threshold
    }

    pub fn allocation_failures(&self) -> usize {
        self.allocation_failures
    }
}

impl TlabRefillPolicy for SimpleTlabRefillPolicy {
    fn should_refill(&mut self, size: usize, mark: *mut u8) -> bool {
        if mark.is_null() || size < self.refill_threshold {
            return true;
        }
        if mark != self.last_mark {
            self.last_mark = mark;
            self.allocation_failures = 1;
            return false;
        }
        self.allocation_failures += 1;
        self.allocation_failures > ALLOCATION_FAILURE_TOLERANCE
    }

    fn next_tlab_size(&self) -> usize {
        self.next_size
    }

    fn save_tlab_top(&mut self, top: *mut u8) {
        self.saved_top = top;
    }

    fn saved_tlab_top(&self) -> *mut u8 {
        self.saved_top
    }
}

/// Policy of threads that do not use TLABs: every request goes straight to a belt.
pub struct NeverRefillTlab {
    saved_top: *mut u8,
}

unsafe impl Send for NeverRefillTlab {}

impl Default for NeverRefillTlab {
    fn default() -> Self {
        Self {
            saved_top: null_mut(),
        }
    }
}

impl TlabRefillPolicy for NeverRefillTlab {
    fn should_refill(&mut self, _size: usize, _mark: *mut u8) -> bool {
        false
    }

    fn next_tlab_size(&self) -> usize {
        0
    }

    fn save_tlab_top(&mut self, top: *mut u8) {
        self.saved_top = top;
    }

    fn saved_tlab_top(&self) -> *mut u8 {
        self.saved_top
    }
}
