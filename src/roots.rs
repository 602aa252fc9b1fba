//! Root enumeration.
//!
//! Every mutator keeps its references to heap objects in [StackRoots]: slots it registers and
//! unregisters in stack order. Before such a thread blocks at a safepoint it prepares the
//! reference map of its roots; the stop-the-world daemon completes it. Only completed maps are
//! scanned.

use crate::safepoint::LocalHeapList;

/// Receives the location of every root. The referenced object is `*location`, and a moving
/// collector updates it in place.
pub trait RootVisitor {
    fn visit(&mut self, location: *mut *mut u8);
}

impl<F: FnMut(*mut *mut u8)> RootVisitor for F {
    fn visit(&mut self, location: *mut *mut u8) {
        self(location)
    }
}

/// Subsystem holding object references outside of any thread's roots, such as monitor
/// wait queues.
pub trait MonitorScheme: Send + Sync {
    fn scan_references(&self, visitor: &mut dyn RootVisitor);
}

/// Runtimes without inflated monitors.
#[derive(Default, Clone, Copy, Debug)]
pub struct NoMonitors;

impl MonitorScheme for NoMonitors {
    fn scan_references(&self, _visitor: &mut dyn RootVisitor) {}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StackMapState {
    /// Nothing prepared, the thread is free to push and pop roots.
    Unprepared,
    /// The thread prepared the map down to `depth` slots before it blocked.
    Prepared { depth: usize },
    /// The map covers the first `depth` slots and can be scanned.
    Completed { depth: usize },
}

pub struct StackRoots {
    slots: Vec<*mut *mut u8>,
    map: StackMapState,
}

impl Default for StackRoots {
    fn default() -> Self {
        Self::new()
    }
}

impl StackRoots {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            map: StackMapState::Unprepared,
        }
    }

    pub fn push(&mut self, slot: *mut *mut u8) {
        debug_assert_eq!(self.map, StackMapState::Unprepared);
        self.slots.push(slot);
    }

    pub fn pop(&mut self) -> Option<*mut *mut u8> {
        debug_assert_eq!(self.map, StackMapState::Unprepared);
        self.slots.pop()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn map_state(&self) -> StackMapState {
        self.map
    }

    /// Prepares the part of the map the owning thread can reach itself.
    pub fn prepare(&mut self) {
        self.map = StackMapState::Prepared {
            depth: self.slots.len(),
        };
    }

    /// Completes the map. A thread that never prepared its own map (it was parked) gets it
    /// prepared here in full.
    pub fn complete(&mut self) {
        self.map = match self.map {
            StackMapState::Prepared { depth } | StackMapState::Completed { depth } => {
                StackMapState::Completed { depth }
            }
            StackMapState::Unprepared => StackMapState::Completed {
                depth: self.slots.len(),
            },
        };
    }

    /// Drops the map, the thread may change its roots again.
    pub fn reset(&mut self) {
        self.map = StackMapState::Unprepared;
    }

    pub fn for_each(&self, visitor: &mut dyn RootVisitor) {
        let depth = match self.map {
            StackMapState::Completed { depth } => depth,
            state => crate::fatal!("scanning stack roots with a {:?} reference map", state),
        };
        for slot in &self.slots[..depth] {
            visitor.visit(*slot);
        }
    }

    /// Prepares and completes the map of the calling thread, runs `f` and clears the map again.
    /// Keeps the map valid for exactly the extent of `f`, which the collector thread needs for
    /// its own roots.
    pub fn with_prepared_map<R>(&mut self, f: impl FnOnce(&StackRoots) -> R) -> R {
        self.prepare();
        self.complete();
        let result = f(self);
        self.reset();
        result
    }
}

/// Enumerates all roots sequentially on the calling thread. Only usable while the world is
/// stopped.
pub struct SequentialHeapRootsScanner<'a> {
    heaps: &'a LocalHeapList,
    own_roots: &'a StackRoots,
    monitors: &'a dyn MonitorScheme,
    trace: bool,
}

impl<'a> SequentialHeapRootsScanner<'a> {
    pub fn new(
        heaps: &'a LocalHeapList,
        own_roots: &'a StackRoots,
        monitors: &'a dyn MonitorScheme,
        trace: bool,
    ) -> Self {
        Self {
            heaps,
            own_roots,
            monitors,
            trace,
        }
    }

    pub fn run(&self, visitor: &mut dyn RootVisitor) {
        for heap in self.heaps.iter() {
            let roots = unsafe { heap.stack_roots() };
            logln_if!(
                self.trace,
                target: "roots",
                "scanning {} roots of thread {}",
                roots.len(),
                heap.name()
            );
            roots.for_each(visitor);
        }
        logln_if!(
            self.trace,
            target: "roots",
            "scanning {} roots of the collector thread",
            self.own_roots.len()
        );
        self.own_roots.for_each(visitor);
        logln_if!(self.trace, target: "roots", "scanning monitor references");
        self.monitors.scan_references(visitor);
    }
}
