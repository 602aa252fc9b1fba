use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::local_heap::{LocalHeap, ThreadState};

/// Used to bring all threads with heap access to a safepoint such that e.g. a
/// garbage collection can be performed.
pub struct GlobalSafepoint {
    local_heaps: Mutex<LocalHeapList>,
    barrier: Barrier,
}

/// Intrusive list of the registered local heaps, linked through the heaps themselves.
pub struct LocalHeapList {
    head: *const LocalHeap,
    len: usize,
}

unsafe impl Send for LocalHeapList {}

impl LocalHeapList {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalHeap> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || unsafe {
            let heap = cursor.as_ref()?;
            cursor = heap.next.get();
            Some(heap)
        })
    }
}

struct BarrierState {
    armed: bool,
    stopped: usize,
    /// Bumped on every disarm so a waiter never mistakes the next pause for its own.
    epoch: usize,
}

pub(crate) struct Barrier {
    state: Mutex<BarrierState>,
    cv_resume: Condvar,
    cv_stopped: Condvar,
}

impl Barrier {
    fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState {
                armed: false,
                stopped: 0,
                epoch: 0,
            }),
            cv_resume: Condvar::new(),
            cv_stopped: Condvar::new(),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().armed
    }

    fn arm(&self) {
        let mut state = self.state.lock();
        debug_assert!(!state.armed);
        state.armed = true;
        state.stopped = 0;
    }

    fn disarm(&self) {
        let mut state = self.state.lock();
        state.armed = false;
        state.stopped = 0;
        state.epoch = state.epoch.wrapping_add(1);
        self.cv_resume.notify_all();
    }

    fn wait_until_running_threads_in_safepoint(&self, running: usize) {
        let mut state = self.state.lock();
        while state.stopped < running {
            self.cv_stopped.wait(&mut state);
        }
        debug_assert_eq!(state.stopped, running);
    }

    /// Reports the calling thread as stopped and blocks until the pause is over.
    pub fn wait_in_safepoint(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.armed);
        let epoch = state.epoch;
        state.stopped += 1;
        self.cv_stopped.notify_one();
        while state.epoch == epoch {
            self.cv_resume.wait(&mut state);
        }
    }

    /// Blocks a parked thread that wants to unpark until the pause is over.
    pub fn wait_in_unpark(&self) {
        let mut state = self.state.lock();
        if !state.armed {
            return;
        }
        let epoch = state.epoch;
        while state.epoch == epoch {
            self.cv_resume.wait(&mut state);
        }
    }
}

impl Default for GlobalSafepoint {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalSafepoint {
    pub fn new() -> Self {
        Self {
            local_heaps: Mutex::new(LocalHeapList {
                head: std::ptr::null(),
                len: 0,
            }),
            barrier: Barrier::new(),
        }
    }

    pub(crate) fn barrier(&self) -> &Barrier {
        &self.barrier
    }

    /// Registers `heap`. Blocks while a pause is in progress.
    ///
    /// # Safety
    /// `heap` must be parked, unregistered, and must not move until it is removed again.
    pub(crate) unsafe fn add_local_heap(&self, heap: &LocalHeap) {
        debug_assert!(heap.is_parked());
        let mut list = self.local_heaps.lock();
        heap.prev.set(std::ptr::null());
        heap.next.set(list.head);
        if let Some(head) = list.head.as_ref() {
            head.prev.set(heap);
        }
        list.head = heap;
        list.len += 1;
    }

    /// Unregisters `heap`. Blocks while a pause is in progress.
    ///
    /// # Safety
    /// `heap` must be parked and registered with this safepoint.
    pub(crate) unsafe fn remove_local_heap(&self, heap: &LocalHeap) {
        debug_assert!(heap.is_parked());
        let mut list = self.local_heaps.lock();
        if let Some(next) = heap.next.get().as_ref() {
            next.prev.set(heap.prev.get());
        }
        match heap.prev.get().as_ref() {
            Some(prev) => prev.next.set(heap.next.get()),
            None => list.head = heap.next.get(),
        }
        heap.prev.set(std::ptr::null());
        heap.next.set(std::ptr::null());
        list.len -= 1;
    }

    pub fn number_of_local_heaps(&self) -> usize {
        self.local_heaps.lock().len()
    }

    /// Visits every registered heap while holding the registry lock.
    pub fn iterate(&self, mut f: impl FnMut(&LocalHeap)) {
        let list = self.local_heaps.lock();
        for heap in list.iter() {
            f(heap);
        }
    }

    /// Stops every registered thread. Running threads are asked to stop at their next
    /// safepoint poll, parked threads are kept from unparking. Returns once every running
    /// thread has stopped; dropping the scope resumes them.
    pub fn enter_safepoint_scope(&self) -> SafepointScope<'_> {
        let heaps = self.local_heaps.lock();
        self.barrier.arm();

        let mut running = 0;
        for heap in heaps.iter() {
            match heap.request_safepoint() {
                ThreadState::Running => running += 1,
                ThreadState::Parked => {}
                state => crate::fatal!("safepoint requested for thread in state {:?}", state),
            }
        }
        self.barrier.wait_until_running_threads_in_safepoint(running);

        for heap in heaps.iter() {
            unsafe { heap.freeze() };
        }
        log::trace!(target: "gc", "{} threads stopped ({} were running)", heaps.len(), running);
        SafepointScope {
            safepoint: self,
            heaps,
        }
    }
}

/// The world is stopped for as long as this lives.
pub struct SafepointScope<'a> {
    safepoint: &'a GlobalSafepoint,
    heaps: MutexGuard<'a, LocalHeapList>,
}

impl SafepointScope<'_> {
    pub fn local_heaps(&self) -> &LocalHeapList {
        &self.heaps
    }
}

impl Drop for SafepointScope<'_> {
    fn drop(&mut self) {
        for heap in self.heaps.iter() {
            unsafe { heap.thaw() };
        }
        self.safepoint.barrier.disarm();
    }
}
