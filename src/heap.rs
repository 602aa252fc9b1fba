//! The process-wide heap context.
//!
//! A [Heap] is built once at startup from a resolved [Config] and a [HeapScheme]. It owns the
//! safepoint registry, the stop-the-world daemon, the reference manager with its handler thread
//! and the immortal region. Every thread that allocates attaches a [Mutator] to it.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    daemon::{DaemonSetup, StopTheWorldDaemon},
    error::HeapResult,
    immortal::ImmortalHeap,
    layout::{CellLayout, ObjectLayout},
    local_heap::LocalHeap,
    mutator::Mutator,
    references::{ReferenceHandler, ReferenceHandlers, SpecialReferenceManager},
    roots::{MonitorScheme, NoMonitors},
    safepoint::GlobalSafepoint,
    scheme::HeapScheme,
    statistics::{formatted_size, HeapStatistics, TlabStats},
    Config,
};

/// The runtime's collaborators of a heap.
pub struct HeapOptions {
    pub layout: Arc<dyn ObjectLayout>,
    pub monitors: Arc<dyn MonitorScheme>,
    pub handlers: ReferenceHandlers,
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self {
            layout: Arc::new(CellLayout),
            monitors: Arc::new(NoMonitors),
            handlers: ReferenceHandlers::default(),
        }
    }
}

pub struct Heap<S: HeapScheme> {
    config: Config,
    scheme: S,
    layout: Arc<dyn ObjectLayout>,
    safepoint: Arc<GlobalSafepoint>,
    references: Arc<SpecialReferenceManager>,
    reference_handler: ReferenceHandler,
    daemon: StopTheWorldDaemon,
    immortal: ImmortalHeap,
    /// Serialises collection requests.
    heap_lock: Mutex<()>,
    tlab_stats: TlabStats,
}

impl<S: HeapScheme> Heap<S> {
    pub fn new(config: Config, scheme: S) -> HeapResult<Arc<Self>> {
        Self::with_options(config, scheme, HeapOptions::default())
    }

    pub fn with_options(config: Config, scheme: S, options: HeapOptions) -> HeapResult<Arc<Self>> {
        config.validate()?;
        let safepoint = Arc::new(GlobalSafepoint::new());
        let references = Arc::new(SpecialReferenceManager::new(
            options.handlers,
            config.trace_reference_gc,
        ));
        let reference_handler = ReferenceHandler::start(references.clone())?;
        let immortal = ImmortalHeap::new(&config)?;
        let daemon = StopTheWorldDaemon::start(DaemonSetup {
            safepoint: safepoint.clone(),
            references: references.clone(),
            monitors: options.monitors,
            layout: options.layout.clone(),
            collector: scheme.collector(),
            periodic_interval: config.periodic_gc_interval,
            trace_roots: config.trace_root_scanning,
        })?;
        log::debug!(
            target: "gc",
            "heap initialized: {} reserved, {} immortal, TLAB size {}",
            formatted_size(scheme.reserved_space()),
            formatted_size(immortal.size()),
            formatted_size(config.tlab_size)
        );
        Ok(Arc::new(Self {
            config,
            scheme,
            layout: options.layout,
            safepoint,
            references,
            reference_handler,
            daemon,
            immortal,
            heap_lock: Mutex::new(()),
            tlab_stats: TlabStats::default(),
        }))
    }

    /// Attaches the calling thread. The thread must not already hold a running [Mutator] of
    /// this heap, see [Mutator::spawn] for starting threads from a mutator.
    pub fn attach_mutator(self: &Arc<Self>) -> Mutator<S> {
        let name = std::thread::current()
            .name()
            .unwrap_or("mutator")
            .to_string();
        let mutator = Mutator::attach_parked(self.clone(), name);
        mutator.unpark();
        mutator
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheme(&self) -> &S {
        &self.scheme
    }

    pub fn layout(&self) -> &dyn ObjectLayout {
        &*self.layout
    }

    pub fn safepoint(&self) -> &Arc<GlobalSafepoint> {
        &self.safepoint
    }

    pub fn references(&self) -> &SpecialReferenceManager {
        &self.references
    }

    pub fn immortal(&self) -> &ImmortalHeap {
        &self.immortal
    }

    pub fn tlab_stats(&self) -> &TlabStats {
        &self.tlab_stats
    }

    /// Number of completed collections.
    pub fn invocation_count(&self) -> usize {
        self.daemon.invocation_count()
    }

    /// Runs a collection and reports whether at least `requested` bytes are free afterwards.
    ///
    /// `local` is the heap of the calling thread if it is attached; it is parked for the
    /// duration of the request. A requester that had to wait for another collection skips its
    /// own when that one already freed enough.
    pub fn collect_garbage(&self, local: Option<&LocalHeap>, requested: usize) -> bool {
        if self.config.gc_disabled {
            crate::fatal!("out of memory and GC is disabled");
        }
        if let Some(local) = local {
            local.park();
        }
        let seen = self.daemon.invocation_count();
        let freed_enough = {
            let _lock = self.heap_lock.lock();
            if self.daemon.invocation_count() != seen
                && self.scheme.report_free_space() >= requested
            {
                logln_if!(
                    self.config.verbose,
                    target: "gc",
                    "collection requested for {} skipped, a concurrent one freed enough",
                    formatted_size(requested)
                );
                true
            } else {
                self.collect_locked(requested)
            }
        };
        if let Some(local) = local {
            local.unpark();
        }
        freed_enough
    }

    fn collect_locked(&self, requested: usize) -> bool {
        let used_before = self.scheme.report_used_space();
        let free_before = self.scheme.report_free_space();
        logln_if!(
            self.config.verbose,
            target: "gc",
            "--Start GC {} (requested {}): used {}, free {}",
            self.daemon.invocation_count(),
            formatted_size(requested),
            formatted_size(used_before),
            formatted_size(free_before)
        );
        let invocation = self.daemon.execute(self.scheme.collector());
        let used_after = self.scheme.report_used_space();
        let free_after = self.scheme.report_free_space();
        let freed_enough = free_after >= requested;
        logln_if!(
            self.config.verbose,
            target: "gc",
            "--End GC {}: used {}, free {}, reclaimed {}, {}",
            invocation.saturating_sub(1),
            formatted_size(used_after),
            formatted_size(free_after),
            formatted_size(used_before.saturating_sub(used_after)),
            if freed_enough {
                "freed enough"
            } else {
                "did not free enough"
            }
        );
        freed_enough
    }

    /// Gives the TLAB of `local` a fresh chunk `[chunk, chunk + size)`. The previous TLAB is
    /// made walkable first.
    ///
    /// # Safety
    /// Must be called on the thread owning `local`, and the chunk must be owned by it.
    pub unsafe fn refill_tlab(&self, local: &LocalHeap, chunk: *mut u8, size: usize) {
        if local.is_immortal_allocation_enabled() {
            crate::fatal!(
                "refilling the TLAB of thread {} while it allocates immortal objects",
                local.name()
            );
        }
        let (mark, leftover) = {
            let tlab = local.tlab();
            (tlab.mark(), tlab.leftover())
        };
        if !mark.is_null() {
            self.scheme.do_before_tlab_refill(local, self.layout());
            self.tlab_stats.record_refill(leftover);
        }
        logln_if!(
            self.config.trace_tlab,
            target: "tlab",
            "thread {}: refill TLAB [{:p}, {:p}], {} bytes left in the previous one",
            local.name(),
            chunk,
            chunk.add(size),
            leftover
        );
        local.tlab().initialize(chunk, chunk, size);
    }

    pub fn report_free_space(&self) -> usize {
        self.scheme.report_free_space()
    }

    pub fn report_used_space(&self) -> usize {
        self.scheme.report_used_space()
    }

    /// True when `addr` points into a belt or into the immortal region.
    pub fn contains(&self, addr: *const u8) -> bool {
        self.scheme.contains(addr) || self.immortal.contains(addr)
    }

    pub fn is_valid_ref(&self, object: *const u8) -> bool {
        !object.is_null() && crate::util::is_aligned(object as usize, crate::WORD_SIZE)
            && self.contains(object)
    }

    pub fn pin(&self, object: *mut u8) -> bool {
        self.scheme.pin(object)
    }

    pub fn unpin(&self, object: *mut u8) {
        self.scheme.unpin(object)
    }

    pub fn is_pinned(&self, object: *mut u8) -> bool {
        self.scheme.is_pinned(object)
    }

    /// Hands all pending references to their queues and finalizers on the calling thread.
    pub fn run_finalization(&self) -> usize {
        self.references.run_finalization()
    }

    pub fn statistics(&self) -> HeapStatistics {
        HeapStatistics {
            belt_reserved: self.scheme.reserved_space(),
            belt_used: self.scheme.report_used_space(),
            belt_free: self.scheme.report_free_space(),
            immortal_used: self.immortal.used(),
            immortal_size: self.immortal.size(),
            total_gc_cycles_count: self.daemon.invocation_count(),
            mutators: self.safepoint.number_of_local_heaps(),
            pending_references: self.references.has_pending(),
            finalizees: self.references.finalizee_count(),
        }
    }
}

impl<S: HeapScheme> Drop for Heap<S> {
    fn drop(&mut self) {
        self.daemon.shutdown();
        self.reference_handler.shutdown();
        if self.config.print_tlab_stats {
            eprintln!("{}", self.tlab_stats);
        }
        log::debug!(target: "gc", "{}", self.statistics());
    }
}
