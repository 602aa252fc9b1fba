//! # Beltway
//!
//! Allocation and pause-coordination core of a managed-runtime heap. The crate provides the
//! substrate any collection algorithm plugs into:
//!
//! - [Belts](belt::Belt): bump-pointer regions with a lock-free, CAS-updated allocation mark.
//! - [TLABs](tlab::Tlab): per-thread buffers carved out of belts with a non-atomic fast path.
//! - [Refill policies](refill_policy) deciding when an exhausted TLAB is replaced.
//! - The [immortal region](immortal::ImmortalHeap) for memory that is never reclaimed.
//! - A [stop-the-world daemon](daemon::StopTheWorldDaemon) that freezes every mutator at a
//!   safepoint, runs a [Collector](daemon::Collector) and thaws them again.
//! - The [special reference manager](references::SpecialReferenceManager) that discovers
//!   weak/soft/phantom/final references during tracing and processes them afterwards.
//!
//! The object layout and the class metadata of the runtime are not part of this crate, they are
//! consumed through the [layout] traits. A reference [CellLayout](layout::CellLayout) is provided
//! for runtimes that do not bring their own.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use beltway::{belt::{BeltManager, BeltSpec}, daemon::GcContext, heap::Heap, scheme::BeltwayScheme, Config};
//!
//! let config = Config::default();
//! let belts = Arc::new(BeltManager::new(&config, &[BeltSpec::new(100, false)]).unwrap());
//! let collector_belts = belts.clone();
//! let scheme = BeltwayScheme::new(belts, 0, Arc::new(move |ctx: &mut GcContext<'_>| {
//!     // A collector that considers every object dead.
//!     ctx.reset_tlabs();
//!     collector_belts.belt(0).reset_allocation_mark();
//! }));
//! let heap = Heap::new(config, scheme).unwrap();
//! let mut mutator = heap.attach_mutator();
//! let cell = mutator.allocate_raw(64);
//! assert!(!cell.is_null());
//! ```

/// Logs through the `log` facade when `$cond` holds. Used for the tracing switches of [Config].
macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            log::info!($($t)*);
        }
    };
}

/// Reports a broken heap invariant and aborts the process. See [error::fatal].
#[macro_export]
macro_rules! fatal {
    ($($t:tt)*) => {
        $crate::error::fatal(format_args!($($t)*))
    };
}

pub mod belt;
pub mod daemon;
pub mod error;
pub mod heap;
pub mod immortal;
pub mod layout;
pub mod local_heap;
pub mod mmap;
pub mod mutator;
pub mod references;
pub mod refill_policy;
pub mod roots;
pub mod safepoint;
pub mod scheme;
pub mod statistics;
pub mod tlab;
pub mod util;

use std::{mem::size_of, time::Duration};

use error::ConfigError;

/// Size of a machine word. Cells, TLABs and belts are measured in bytes but aligned to words.
pub const WORD_SIZE: usize = size_of::<usize>();

/// Smallest heap that can be configured.
pub const MIN_HEAP_SIZE: usize = 1024 * 1024;

/// If the initial heap size is not given it is `max_heap_size / DEFAULT_INIT_HEAP_SIZE_RATIO`.
pub const DEFAULT_INIT_HEAP_SIZE_RATIO: usize = 2;

/// Configuration for heap constructor. Values are resolved once and never change afterwards.
#[derive(Clone, Debug)]
pub struct Config {
    /// Size of the virtual memory reserved for belts. Expandable belts may grow up to it.
    pub max_heap_size: usize,
    /// Memory initially handed to belts according to their frame percentage.
    pub initial_heap_size: usize,
    /// Size of thread local allocation buffers.
    pub tlab_size: usize,
    /// Use thread local allocation buffers. When disabled every allocation takes the slow path.
    pub use_tlab: bool,
    /// A failed request smaller than this percentage of a TLAB always refills the TLAB.
    pub tlab_refill_threshold_percent: usize,
    /// Size of the immortal region. It never grows.
    pub immortal_size: usize,
    /// Prefix every cell with a word holding [layout::DEBUG_TAG].
    pub debug_tagging: bool,
    /// Any request for a collection aborts the process.
    pub gc_disabled: bool,
    /// Run a collection at this interval even when nobody asks for one.
    pub periodic_gc_interval: Option<Duration>,
    /// Report every collection with used/free space before and after.
    pub verbose: bool,
    pub trace_tlab: bool,
    pub trace_root_scanning: bool,
    pub trace_reference_gc: bool,
    pub trace_immortal: bool,
    /// Print TLAB statistics when the heap is torn down.
    pub print_tlab_stats: bool,
}

impl Default for Config {
    fn default() -> Self {
        let max_heap_size = 64 * 1024 * 1024;
        Self {
            max_heap_size,
            initial_heap_size: max_heap_size / DEFAULT_INIT_HEAP_SIZE_RATIO,
            tlab_size: 64 * 1024,
            use_tlab: true,
            tlab_refill_threshold_percent: 10,
            immortal_size: 1024 * 1024,
            debug_tagging: false,
            gc_disabled: false,
            periodic_gc_interval: None,
            verbose: false,
            trace_tlab: false,
            trace_root_scanning: false,
            trace_reference_gc: false,
            trace_immortal: false,
            print_tlab_stats: false,
        }
    }
}

impl Config {
    /// Checks that the sizes are consistent with each other.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_heap_size < MIN_HEAP_SIZE {
            return Err(ConfigError::HeapTooSmall {
                size: self.max_heap_size,
                min: MIN_HEAP_SIZE,
            });
        }
        if self.initial_heap_size > self.max_heap_size {
            return Err(ConfigError::IncompatibleHeapSizes {
                initial: self.initial_heap_size,
                max: self.max_heap_size,
            });
        }
        let min_tlab = tlab::Tlab::headroom(self.debug_tagging) + WORD_SIZE;
        if self.tlab_size < min_tlab || !util::is_aligned(self.tlab_size, WORD_SIZE) {
            return Err(ConfigError::BadTlabSize {
                size: self.tlab_size,
                min: min_tlab,
            });
        }
        if self.tlab_refill_threshold_percent > 100 {
            return Err(ConfigError::BadRefillThreshold(
                self.tlab_refill_threshold_percent,
            ));
        }
        if self.immortal_size == 0 {
            return Err(ConfigError::EmptyImmortalRegion);
        }
        Ok(())
    }

    /// Size of the cell header prefix added in debug tagging mode.
    pub fn debug_tag_size(&self) -> usize {
        if self.debug_tagging {
            WORD_SIZE
        } else {
            0
        }
    }
}
