//! Region for memory that is never collected and never moves.

use std::{
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use crossbeam_utils::{Backoff, CachePadded};

use crate::{
    error::{HeapError, HeapResult},
    layout::adjust_for_debug_tag,
    mmap::Mmap,
    util::distance,
    Config, WORD_SIZE,
};

pub struct ImmortalHeap {
    memory: Mmap,
    mark: CachePadded<AtomicPtr<u8>>,
    tagging: bool,
    trace: bool,
}

impl ImmortalHeap {
    pub fn new(config: &Config) -> HeapResult<Self> {
        let memory = Mmap::new(config.immortal_size).map_err(|source| HeapError::Reservation {
            size: config.immortal_size,
            source,
        })?;
        let start = memory.start();
        Ok(Self {
            memory,
            mark: CachePadded::new(AtomicPtr::new(start)),
            tagging: config.debug_tagging,
            trace: config.trace_immortal,
        })
    }

    /// Allocates `size` zeroed bytes. The region does not grow: running out of it is fatal.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        let tag = if self.tagging { WORD_SIZE } else { 0 };
        let backoff = Backoff::new();
        let mut old = self.mark.load(Ordering::Relaxed);
        let cell = loop {
            let end = old as usize + tag + size;
            if end > self.memory.end() as usize {
                crate::fatal!(
                    "out of immortal memory: {} bytes requested, {} of {} bytes used",
                    size,
                    self.used(),
                    self.memory.size()
                );
            }
            match self.mark.compare_exchange_weak(
                old,
                end as *mut u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break unsafe { adjust_for_debug_tag(old, self.tagging) },
                Err(current) => {
                    old = current;
                    backoff.spin();
                }
            }
        };
        unsafe { ptr::write_bytes(cell, 0, size) };
        logln_if!(
            self.trace,
            target: "immortal",
            "allocated {} bytes at {:p} in immortal region",
            size,
            cell
        );
        cell
    }

    pub fn contains(&self, addr: *const u8) -> bool {
        self.memory.contains(addr)
    }

    pub fn used(&self) -> usize {
        distance(self.memory.start(), self.mark.load(Ordering::Acquire))
    }

    pub fn size(&self) -> usize {
        self.memory.size()
    }

    pub fn start(&self) -> *mut u8 {
        self.memory.start()
    }
}
