use std::{
    cell::{Cell, UnsafeCell},
    ptr::null_mut,
    sync::{atomic::AtomicUsize, Arc},
};

use atomic::{Atomic, Ordering};

use crate::{
    layout::ObjectLayout,
    refill_policy::{NeverRefillTlab, SimpleTlabRefillPolicy, TlabRefillPolicy},
    roots::StackRoots,
    safepoint::GlobalSafepoint,
    tlab::{Tlab, TlabExtent},
    Config,
};

/// LocalHeap is used by the GC to track all threads with heap access in order to
/// stop them before performing a collection. LocalHeaps can be either Parked or
/// Running and are in Parked mode when initialized.
///   Running: Thread is allowed to access the heap but needs to give the GC the
///            chance to run regularly by manually invoking `safepoint()`. The
///            thread can be parked using `park()`.
///   Parked:  Heap access is not allowed, so the GC will not stop this thread
///            for a collection. Useful when threads do not need heap access for
///            some time or for blocking operations like locking a mutex.
///
/// Besides the state, a local heap holds everything the collector has to reach in another
/// thread while the world is stopped: the TLAB, the refill policy and the stack roots.
pub struct LocalHeap {
    state: Atomic<ThreadState>,
    pub(crate) prev: Cell<*const LocalHeap>,
    pub(crate) next: Cell<*const LocalHeap>,
    safepoint: Arc<GlobalSafepoint>,
    tlab: UnsafeCell<Tlab>,
    refill_policy: UnsafeCell<Option<Box<dyn TlabRefillPolicy>>>,
    allocation_disabled: AtomicUsize,
    /// TLAB put aside while allocation goes to the immortal region.
    immortal_stash: UnsafeCell<Option<TlabExtent>>,
    roots: UnsafeCell<StackRoots>,
    name: String,
    tlab_size: usize,
    use_tlab: bool,
    refill_threshold_percent: usize,
    trace_tlab: bool,
}

unsafe impl Send for LocalHeap {}
unsafe impl Sync for LocalHeap {}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum ThreadState {
    /// Threads in this state are allowed to access the heap.
    Running,
    /// Thread was parked, which means that the thread is not allowed to access
    /// or manipulate the heap in any way. This is considered to be a safepoint.
    Parked,

    /// SafepointRequested is used for Running threads to force `safepoint()` and
    /// `park()` into the slow path.
    SafepointRequested,
    /// A thread transitions into this state from SafepointRequested when it
    /// enters a safepoint.
    Safepoint,
    /// This state is used for Parked threads and forces `unpark()` into
    /// the slow path. It prevents `unpark()` to succeed before the safepoint
    /// operation is finished.
    ParkedSafepointRequested,
}

impl LocalHeap {
    pub(crate) fn new(safepoint: Arc<GlobalSafepoint>, config: &Config, name: String) -> Box<Self> {
        Box::new(Self {
            state: Atomic::new(ThreadState::Parked),
            prev: Cell::new(std::ptr::null()),
            next: Cell::new(std::ptr::null()),
            safepoint,
            tlab: UnsafeCell::new(Tlab::new(config.debug_tagging)),
            refill_policy: UnsafeCell::new(None),
            allocation_disabled: AtomicUsize::new(0),
            immortal_stash: UnsafeCell::new(None),
            roots: UnsafeCell::new(StackRoots::new()),
            name,
            tlab_size: config.tlab_size,
            use_tlab: config.use_tlab,
            refill_threshold_percent: config.tlab_refill_threshold_percent,
            trace_tlab: config.trace_tlab,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        self.state.load(Ordering::Acquire)
    }

    pub fn is_parked(&self) -> bool {
        matches!(
            self.state(),
            ThreadState::Parked | ThreadState::ParkedSafepointRequested
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            ThreadState::Running | ThreadState::SafepointRequested
        )
    }

    /// Gives up heap access, e.g. before blocking. A collection can run without waiting for a
    /// parked thread.
    pub fn park(&self) {
        if self
            .state
            .compare_exchange(
                ThreadState::Running,
                ThreadState::Parked,
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_err()
        {
            self.park_slow();
        }
    }

    #[cold]
    #[inline(never)]
    fn park_slow(&self) {
        loop {
            match self.state() {
                ThreadState::SafepointRequested => self.safepoint_slow(),
                ThreadState::Running => {
                    if self
                        .state
                        .compare_exchange(
                            ThreadState::Running,
                            ThreadState::Parked,
                            Ordering::SeqCst,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                state => crate::fatal!("thread {} parks in state {:?}", self.name, state),
            }
        }
    }

    /// Takes heap access back. Blocks while a pause is in progress.
    pub fn unpark(&self) {
        if self
            .state
            .compare_exchange(
                ThreadState::Parked,
                ThreadState::Running,
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_err()
        {
            self.unpark_slow();
        }
    }

    #[cold]
    #[inline(never)]
    fn unpark_slow(&self) {
        loop {
            match self.state() {
                ThreadState::ParkedSafepointRequested => {
                    self.safepoint.barrier().wait_in_unpark();
                }
                ThreadState::Parked => {
                    if self
                        .state
                        .compare_exchange(
                            ThreadState::Parked,
                            ThreadState::Running,
                            Ordering::SeqCst,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                state => crate::fatal!("thread {} unparks in state {:?}", self.name, state),
            }
        }
    }

    /// Safepoint poll. Blocks for the duration of a pause if one was requested.
    #[inline(always)]
    pub fn safepoint(&self) -> bool {
        if self.state.load(Ordering::Relaxed) == ThreadState::SafepointRequested {
            self.safepoint_slow();
            return true;
        }
        false
    }

    #[cold]
    #[inline(never)]
    fn safepoint_slow(&self) {
        self.before_blocking();
        if self
            .state
            .compare_exchange(
                ThreadState::SafepointRequested,
                ThreadState::Safepoint,
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_err()
        {
            crate::fatal!(
                "thread {} entered a safepoint in state {:?}",
                self.name,
                self.state()
            );
        }
        self.safepoint.barrier().wait_in_safepoint();
    }

    /// What a stopping thread does for the collector before it blocks: it can no longer
    /// allocate, and it prepares the part of its reference map it can reach.
    fn before_blocking(&self) {
        self.disable_allocation();
        unsafe { (*self.roots.get()).prepare() };
    }

    /// Moves a running thread to SafepointRequested and a parked one to
    /// ParkedSafepointRequested. Returns the state found.
    pub(crate) fn request_safepoint(&self) -> ThreadState {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            let requested = match current {
                ThreadState::Running => ThreadState::SafepointRequested,
                ThreadState::Parked => ThreadState::ParkedSafepointRequested,
                state => return state,
            };
            match self.state.compare_exchange_weak(
                current,
                requested,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(state) => current = state,
            }
        }
    }

    /// Called by the daemon once every running thread stopped.
    ///
    /// # Safety
    /// The world must be stopped.
    pub(crate) unsafe fn freeze(&self) {
        if self.state() == ThreadState::ParkedSafepointRequested {
            // a parked thread did not run before_blocking
            self.disable_allocation();
        }
        (*self.roots.get()).complete();
    }

    /// # Safety
    /// The world must be stopped.
    pub(crate) unsafe fn thaw(&self) {
        (*self.roots.get()).reset();
        self.enable_allocation();
        let resumed = match self.state() {
            ThreadState::Safepoint => ThreadState::Running,
            ThreadState::ParkedSafepointRequested => ThreadState::Parked,
            state => crate::fatal!("thread {} thawed in state {:?}", self.name, state),
        };
        self.state.store(resumed, Ordering::SeqCst);
    }

    /// # Safety
    /// Only the owning thread, or the collector while the world is stopped, may use the TLAB.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn tlab(&self) -> &mut Tlab {
        &mut *self.tlab.get()
    }

    /// # Safety
    /// Same as [LocalHeap::tlab].
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn refill_policy(&self) -> Option<&mut (dyn TlabRefillPolicy + 'static)> {
        (*self.refill_policy.get()).as_deref_mut()
    }

    /// Refill policy of the thread, created on first use.
    ///
    /// # Safety
    /// Same as [LocalHeap::tlab].
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn refill_policy_or_init(&self) -> &mut dyn TlabRefillPolicy {
        let policy = (*self.refill_policy.get()).get_or_insert_with(
            || -> Box<dyn TlabRefillPolicy> {
                if self.use_tlab {
                    Box::new(SimpleTlabRefillPolicy::new(
                        self.tlab_size,
                        self.refill_threshold_percent,
                    ))
                } else {
                    Box::new(NeverRefillTlab::default())
                }
            },
        );
        &mut **policy
    }

    /// The allocation fast path.
    #[inline(always)]
    pub fn tlab_allocate(&self, size: usize, layout: &dyn ObjectLayout) -> *mut u8 {
        unsafe { self.tlab().allocate(size, layout) }
    }

    pub fn tlab_extent(&self) -> TlabExtent {
        unsafe { self.tlab().extent() }
    }

    pub fn is_allocation_disabled(&self) -> bool {
        self.allocation_disabled.load(Ordering::Acquire) != 0
    }

    /// Forbids allocation on this thread until the matching [enable_allocation] call. Calls
    /// nest. The TLAB bound is moved into the refill policy so that the fast path fails and the
    /// slow path reports the violation.
    ///
    /// [enable_allocation]: LocalHeap::enable_allocation
    pub fn disable_allocation(&self) {
        if self.allocation_disabled.fetch_add(1, Ordering::AcqRel) == 0 {
            unsafe {
                let end = self.tlab().take_end_allocation_mark();
                if let Some(policy) = self.refill_policy() {
                    policy.save_tlab_top(end);
                }
            }
        }
    }

    pub fn enable_allocation(&self) {
        let depth = self.allocation_disabled.load(Ordering::Acquire);
        if depth == 0 {
            crate::fatal!(
                "unbalanced call to enable allocation on thread {}",
                self.name
            );
        }
        if self.allocation_disabled.fetch_sub(1, Ordering::AcqRel) == 1 {
            unsafe {
                if let Some(policy) = self.refill_policy() {
                    let end = policy.saved_tlab_top();
                    policy.save_tlab_top(null_mut());
                    self.tlab().restore_end_allocation_mark(end);
                }
            }
        }
    }

    pub fn is_immortal_allocation_enabled(&self) -> bool {
        unsafe { (*self.immortal_stash.get()).is_some() }
    }

    /// Routes every allocation of this thread to the immortal region. The TLAB is put aside
    /// and comes back with [LocalHeap::disable_immortal_allocation].
    pub fn enable_immortal_allocation(&self) {
        unsafe {
            let stash = &mut *self.immortal_stash.get();
            if stash.is_some() {
                crate::fatal!(
                    "immortal allocation already enabled on thread {}",
                    self.name
                );
            }
            let tlab = self.tlab();
            *stash = Some(tlab.extent());
            tlab.unset();
        }
    }

    pub fn disable_immortal_allocation(&self) {
        unsafe {
            let stash = match (*self.immortal_stash.get()).take() {
                Some(stash) => stash,
                None => crate::fatal!("immortal allocation not enabled on thread {}", self.name),
            };
            let tlab = self.tlab();
            if stash.start.is_null() {
                tlab.unset();
            } else {
                tlab.initialize(stash.start, stash.mark, stash.size);
                if self.is_allocation_disabled() {
                    let end = tlab.take_end_allocation_mark();
                    if let Some(policy) = self.refill_policy() {
                        policy.save_tlab_top(end);
                    }
                }
            }
        }
    }

    /// Fills the unused part of the TLAB and drops it, leaving the thread without a TLAB. Run
    /// on every thread when a collection starts.
    ///
    /// # Safety
    /// The world must be stopped, or the caller must be the owning thread.
    pub unsafe fn reset_tlab(&self, layout: &dyn ObjectLayout) {
        let tlab = self.tlab();
        if tlab.is_set() {
            logln_if!(
                self.trace_tlab,
                target: "tlab",
                "thread {}: resetting TLAB [{:p}, {:p}], {} bytes left",
                self.name,
                tlab.start(),
                tlab.top(),
                tlab.leftover()
            );
            tlab.fill_tlab(layout);
            tlab.unset();
        }
        if self.is_allocation_disabled() {
            if let Some(policy) = self.refill_policy() {
                policy.save_tlab_top(null_mut());
            }
        }
        if let Some(stash) = (*self.immortal_stash.get()).as_mut() {
            if !stash.start.is_null() {
                let mut stashed = Tlab::new(tlab.is_tagging());
                stashed.initialize(stash.start, stash.mark, stash.size);
                stashed.fill_tlab(layout);
                *stash = TlabExtent {
                    start: null_mut(),
                    mark: null_mut(),
                    size: 0,
                };
            }
        }
    }

    /// Registers a root slot. Roots are popped in reverse order.
    pub fn push_root(&self, slot: *mut *mut u8) {
        unsafe { (*self.roots.get()).push(slot) }
    }

    pub fn pop_root(&self) -> Option<*mut *mut u8> {
        unsafe { (*self.roots.get()).pop() }
    }

    /// # Safety
    /// The world must be stopped, or the caller must be the owning thread.
    pub unsafe fn stack_roots(&self) -> &StackRoots {
        &*self.roots.get()
    }
}
