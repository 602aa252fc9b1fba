//! The stop-the-world daemon.
//!
//! A dedicated thread runs every collection. A request goes through these steps:
//!
//! 1. Freezing: every registered thread is asked to stop at its next safepoint. A stopping
//!    thread disables its own allocation and prepares its reference map before it blocks.
//! 2. Waiting: the daemon blocks until all running threads stopped, then completes the maps of
//!    every thread and disables allocation for the ones that were parked.
//! 3. Collecting: with the reference manager's lock held, the [Collector] runs with the
//!    daemon's own reference map prepared around the call.
//! 4. Thawing: maps are dropped, allocation is re-enabled and the threads resume.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    error::{HeapError, HeapResult},
    layout::ObjectLayout,
    local_heap::LocalHeap,
    references::SpecialReferenceManager,
    roots::{MonitorScheme, SequentialHeapRootsScanner, StackRoots},
    safepoint::{GlobalSafepoint, LocalHeapList},
    tlab::TlabChain,
};

/// A collection algorithm. Runs on the daemon thread while the world is stopped.
pub trait Collector: Send + Sync {
    fn collect(&self, ctx: &mut GcContext<'_>);
}

impl<F: Fn(&mut GcContext<'_>) + Send + Sync> Collector for F {
    fn collect(&self, ctx: &mut GcContext<'_>) {
        self(ctx)
    }
}

/// What a [Collector] can reach during a collection.
pub struct GcContext<'a> {
    invocation_count: usize,
    heaps: &'a LocalHeapList,
    references: &'a SpecialReferenceManager,
    monitors: &'a dyn MonitorScheme,
    layout: &'a dyn ObjectLayout,
    own_roots: &'a StackRoots,
    trace_roots: bool,
}

impl<'a> GcContext<'a> {
    /// Number of collections completed before this one.
    pub fn invocation_count(&self) -> usize {
        self.invocation_count
    }

    pub fn roots_scanner(&self) -> SequentialHeapRootsScanner<'_> {
        SequentialHeapRootsScanner::new(self.heaps, self.own_roots, self.monitors, self.trace_roots)
    }

    /// The reference manager. Its lock is held by the daemon for the whole collection.
    pub fn references(&self) -> &SpecialReferenceManager {
        self.references
    }

    pub fn layout(&self) -> &dyn ObjectLayout {
        self.layout
    }

    pub fn local_heaps(&self) -> &LocalHeapList {
        self.heaps
    }

    pub fn for_each_local_heap(&self, f: impl FnMut(&LocalHeap)) {
        self.heaps.iter().for_each(f);
    }

    /// Fills and drops the TLAB of every thread.
    pub fn reset_tlabs(&mut self) {
        for heap in self.heaps.iter() {
            unsafe { heap.reset_tlab(self.layout) };
        }
    }

    /// Links the TLABs of every thread that has one.
    pub fn chain_tlabs(&self) -> TlabChain {
        let mut chain = TlabChain::new();
        for heap in self.heaps.iter() {
            unsafe {
                let tlab = heap.tlab();
                if tlab.is_set() {
                    chain.push(tlab);
                }
            }
        }
        chain
    }
}

/// Everything the daemon thread needs.
pub struct DaemonSetup {
    pub safepoint: Arc<GlobalSafepoint>,
    pub references: Arc<SpecialReferenceManager>,
    pub monitors: Arc<dyn MonitorScheme>,
    pub layout: Arc<dyn ObjectLayout>,
    /// Collector of periodic collections.
    pub collector: Arc<dyn Collector>,
    pub periodic_interval: Option<Duration>,
    pub trace_roots: bool,
}

struct RequestState {
    /// Requests not yet run, by ticket. Every request runs its own cycle.
    queue: VecDeque<(u64, Arc<dyn Collector>)>,
    requested: u64,
    completed: u64,
    shutdown: bool,
}

struct DaemonShared {
    request: Mutex<RequestState>,
    cv_request: Condvar,
    cv_completed: Condvar,
    invocation_count: AtomicUsize,
    setup: DaemonSetup,
}

impl DaemonShared {
    fn run(&self) {
        let mut own_roots = StackRoots::new();
        let mut state = self.request.lock();
        loop {
            if let Some((ticket, collector)) = state.queue.pop_front() {
                MutexGuard::unlocked(&mut state, || self.cycle(&*collector, &mut own_roots));
                state.completed = ticket;
                self.cv_completed.notify_all();
                continue;
            }
            if state.shutdown {
                break;
            }
            match self.setup.periodic_interval {
                Some(interval) => {
                    let timed_out = self.cv_request.wait_for(&mut state, interval).timed_out();
                    if timed_out && state.queue.is_empty() && !state.shutdown {
                        log::debug!(target: "gc", "periodic collection");
                        let collector = self.setup.collector.clone();
                        MutexGuard::unlocked(&mut state, || {
                            self.cycle(&*collector, &mut own_roots)
                        });
                    }
                }
                None => self.cv_request.wait(&mut state),
            }
        }
    }

    fn cycle(&self, collector: &dyn Collector, own_roots: &mut StackRoots) {
        let setup = &self.setup;
        let scope = setup.safepoint.enter_safepoint_scope();
        {
            let _references = setup.references.lock();
            setup.references.discover_finalizees();
            let invocation_count = self.invocation_count.load(Ordering::Acquire);
            log::debug!(
                target: "gc",
                "collection {} started, {} threads stopped",
                invocation_count,
                scope.local_heaps().len()
            );
            own_roots.with_prepared_map(|own_roots| {
                let mut ctx = GcContext {
                    invocation_count,
                    heaps: scope.local_heaps(),
                    references: &setup.references,
                    monitors: &*setup.monitors,
                    layout: &*setup.layout,
                    own_roots,
                    trace_roots: setup.trace_roots,
                };
                collector.collect(&mut ctx);
            });
            self.invocation_count.fetch_add(1, Ordering::AcqRel);
            log::debug!(target: "gc", "collection {} finished", invocation_count);
        }
        drop(scope);
        setup.references.notify_pending();
    }
}

pub struct StopTheWorldDaemon {
    shared: Arc<DaemonShared>,
    thread: Option<JoinHandle<()>>,
}

impl StopTheWorldDaemon {
    pub fn start(setup: DaemonSetup) -> HeapResult<Self> {
        let shared = Arc::new(DaemonShared {
            request: Mutex::new(RequestState {
                queue: VecDeque::new(),
                requested: 0,
                completed: 0,
                shutdown: false,
            }),
            cv_request: Condvar::new(),
            cv_completed: Condvar::new(),
            invocation_count: AtomicUsize::new(0),
            setup,
        });
        let daemon = shared.clone();
        let thread = std::thread::Builder::new()
            .name("GC".into())
            .spawn(move || daemon.run())
            .map_err(|source| HeapError::ThreadSpawn {
                name: "stop-the-world daemon",
                source,
            })?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Number of completed collections.
    pub fn invocation_count(&self) -> usize {
        self.shared.invocation_count.load(Ordering::Acquire)
    }

    /// Runs `collector` in a stop-the-world pause on the daemon thread and waits for it.
    /// Requests are served in order, one pause each. Returns the number of completed
    /// collections afterwards.
    ///
    /// The calling thread must not hold heap access: a running thread would never reach the
    /// safepoint the daemon waits for.
    pub fn execute(&self, collector: Arc<dyn Collector>) -> usize {
        let mut state = self.shared.request.lock();
        if state.shutdown {
            return self.invocation_count();
        }
        state.requested += 1;
        let ticket = state.requested;
        state.queue.push_back((ticket, collector));
        self.shared.cv_request.notify_one();
        while state.completed < ticket {
            self.shared.cv_completed.wait(&mut state);
        }
        self.invocation_count()
    }

    /// Finishes outstanding requests and stops the daemon thread.
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            {
                let mut state = self.shared.request.lock();
                state.shutdown = true;
                self.shared.cv_request.notify_all();
            }
            let _ = thread.join();
        }
    }
}

impl Drop for StopTheWorldDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}
