//! Weak, soft and phantom references and finalization.
//!
//! Reference objects are handled in two phases, both while the world is stopped and the
//! manager's lock is held. While tracing, the collector [discovers](SpecialReferenceManager::discover)
//! every reference object it reaches instead of tracing its referent. Once tracing is done,
//! [process_discovered](SpecialReferenceManager::process_discovered) decides for every
//! discovered reference whether its referent survived, clears or preserves it, and moves the
//! reference to the pending list. The reference handler thread drains the pending list into
//! the runtime's reference queues and runs finalizers.
//!
//! The lists are intrusive: they are linked through fields of the reference objects and never
//! own them.

use std::{
    ptr::{self, null_mut},
    sync::{
        atomic::{AtomicBool, AtomicPtr, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    error::{HeapError, HeapResult},
    layout::Hub,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReferenceKind {
    Soft,
    Weak,
    Phantom,
    /// Keeps a finalizable object reachable from the finalization registry.
    Final,
}

impl ReferenceKind {
    /// Soft and weak references lose their referent when it dies. The others keep it alive for
    /// one more cycle so that it can be finalized or observed.
    pub fn clears_referent(self) -> bool {
        matches!(self, Self::Soft | Self::Weak)
    }
}

/// Header of a reference object as seen by the collector.
///
/// A reference is active while `next` is null. Once its referent dies it becomes pending:
/// `next` links it into the pending list and the last pending reference points to itself.
/// `discovered` is non-null exactly while the reference is on the discovered list.
#[repr(C)]
pub struct ReferenceObject {
    referent: AtomicPtr<u8>,
    queue: AtomicPtr<u8>,
    next: AtomicPtr<ReferenceObject>,
    discovered: AtomicPtr<ReferenceObject>,
    kind: ReferenceKind,
}

impl ReferenceObject {
    /// `queue` is an opaque handle of the runtime's reference queue, null if the reference was
    /// created without one.
    pub fn new(kind: ReferenceKind, referent: *mut u8, queue: *mut u8) -> Self {
        Self {
            referent: AtomicPtr::new(referent),
            queue: AtomicPtr::new(queue),
            next: AtomicPtr::new(null_mut()),
            discovered: AtomicPtr::new(null_mut()),
            kind,
        }
    }

    pub fn kind(&self) -> ReferenceKind {
        self.kind
    }

    pub fn referent(&self) -> *mut u8 {
        self.referent.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.referent.store(null_mut(), Ordering::Release);
    }

    pub fn queue(&self) -> *mut u8 {
        self.queue.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.next.load(Ordering::Acquire).is_null()
    }

    pub fn is_discovered(&self) -> bool {
        !self.discovered.load(Ordering::Acquire).is_null()
    }

    fn as_ptr(&self) -> *mut ReferenceObject {
        self as *const Self as *mut Self
    }
}

/// Reachability oracle of the collector running the current cycle.
pub trait ReferenceTracer {
    fn is_reachable(&self, object: *mut u8) -> bool;

    /// Keeps `object` alive and returns its address after the collection.
    fn preserve(&mut self, object: *mut u8) -> *mut u8;

    /// True when live objects move, so that referents of surviving references must be updated.
    fn may_relocate_live_objects(&self) -> bool {
        false
    }
}

/// Receives references whose referent died, to be appended to the runtime's queue.
pub trait ReferenceQueueSink: Send + Sync {
    fn enqueue(&self, reference: &ReferenceObject);
}

/// Runs the finalizer of an object that became unreachable.
pub trait Finalizer: Send + Sync {
    fn finalize(&self, object: *mut u8);
}

impl<F: Fn(&ReferenceObject) + Send + Sync> ReferenceQueueSink for F {
    fn enqueue(&self, reference: &ReferenceObject) {
        self(reference)
    }
}

impl<F: Fn(*mut u8) + Send + Sync> Finalizer for F {
    fn finalize(&self, object: *mut u8) {
        self(object)
    }
}

/// Where pending references go.
#[derive(Clone)]
pub struct ReferenceHandlers {
    pub queue: Arc<dyn ReferenceQueueSink>,
    pub finalizer: Arc<dyn Finalizer>,
}

impl Default for ReferenceHandlers {
    fn default() -> Self {
        Self {
            queue: Arc::new(|reference: &ReferenceObject| {
                log::debug!(target: "references", "dropping pending {:?} reference", reference.kind());
            }),
            finalizer: Arc::new(|object: *mut u8| {
                log::debug!(target: "references", "no finalizer installed for {:p}", object);
            }),
        }
    }
}

pub struct SpecialReferenceManager {
    lock: Mutex<()>,
    pending_cv: Condvar,
    discovered: AtomicPtr<ReferenceObject>,
    pending: AtomicPtr<ReferenceObject>,
    /// Terminates the discovered list. Its own discovered link points to itself so it can
    /// never be discovered.
    sentinel: Box<ReferenceObject>,
    finalizees: Mutex<Vec<Box<ReferenceObject>>>,
    handlers: ReferenceHandlers,
    shutdown: AtomicBool,
    trace: bool,
}

impl SpecialReferenceManager {
    pub fn new(handlers: ReferenceHandlers, trace: bool) -> Self {
        let sentinel = Box::new(ReferenceObject::new(
            ReferenceKind::Weak,
            null_mut(),
            null_mut(),
        ));
        let sentinel_ptr = sentinel.as_ptr();
        sentinel.discovered.store(sentinel_ptr, Ordering::Relaxed);
        sentinel.next.store(sentinel_ptr, Ordering::Relaxed);
        Self {
            lock: Mutex::new(()),
            pending_cv: Condvar::new(),
            discovered: AtomicPtr::new(sentinel_ptr),
            pending: AtomicPtr::new(null_mut()),
            sentinel,
            finalizees: Mutex::new(Vec::new()),
            handlers,
            shutdown: AtomicBool::new(false),
            trace,
        }
    }

    /// The lock serialising reference processing with the reference handler. The
    /// stop-the-world daemon holds it for the whole collection.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    fn sentinel_ptr(&self) -> *mut ReferenceObject {
        self.sentinel.as_ptr()
    }

    /// Links `reference` into the discovered list unless it is already on it.
    ///
    /// # Safety
    /// `reference` must stay valid until the next call to
    /// [process_discovered](Self::process_discovered) has returned. The lock must be held.
    pub unsafe fn discover(&self, reference: &ReferenceObject) {
        debug_assert!(self.lock.is_locked());
        if reference.is_discovered() {
            return;
        }
        let head = self.discovered.load(Ordering::Relaxed);
        if reference.as_ptr() == head {
            crate::fatal!("reference {:p} is already on the discovered list", reference);
        }
        reference.discovered.store(head, Ordering::Relaxed);
        self.discovered.store(reference.as_ptr(), Ordering::Relaxed);
        logln_if!(
            self.trace,
            target: "references",
            "added {:?} reference {:p} {{referent={:p}}} to list of discovered references",
            reference.kind(),
            reference,
            reference.referent()
        );
    }

    /// Decides the fate of every discovered reference. Tracing may continue while this runs
    /// (preserving a referent can discover more references); the newly discovered ones are
    /// processed in further passes until no more show up.
    pub fn process_discovered(&self, tracer: &mut dyn ReferenceTracer) {
        debug_assert!(self.lock.is_locked());
        let relocate = tracer.may_relocate_live_objects();
        let mut head = self.discovered.load(Ordering::Relaxed);
        let mut end = self.sentinel_ptr();
        loop {
            let mut cursor = head;
            let mut pending = self.pending.load(Ordering::Relaxed);
            while cursor != end {
                let reference = unsafe { &*cursor };
                let referent = reference.referent();
                let mut outcome = "reachable";
                if referent.is_null() {
                    outcome = "null referent, not added to pending list";
                } else if !tracer.is_reachable(referent) {
                    if reference.queue().is_null() && reference.kind() != ReferenceKind::Final {
                        log::warn!(
                            target: "references",
                            "cannot add reference {:p} with null queue to pending list",
                            reference
                        );
                        outcome = "unreachable, null queue";
                    } else {
                        if reference.kind().clears_referent() {
                            reference.clear();
                            outcome = "unreachable, cleared";
                        } else {
                            reference
                                .referent
                                .store(tracer.preserve(referent), Ordering::Release);
                            outcome = "unreachable, preserved";
                        }
                        if reference.is_active() {
                            let next = if pending.is_null() { cursor } else { pending };
                            reference.next.store(next, Ordering::Release);
                            pending = cursor;
                        }
                    }
                } else if relocate {
                    reference
                        .referent
                        .store(tracer.preserve(referent), Ordering::Release);
                    outcome = "reachable, updated";
                }

                cursor = reference.discovered.swap(null_mut(), Ordering::Relaxed);
                logln_if!(
                    self.trace,
                    target: "references",
                    "processed {:?} reference {:p} whose referent {:p}: {} (now {:p})",
                    reference.kind(),
                    reference,
                    referent,
                    outcome,
                    reference.referent()
                );
            }
            self.pending.store(pending, Ordering::Release);

            let current = self.discovered.load(Ordering::Relaxed);
            if current == head {
                self.discovered
                    .store(self.sentinel_ptr(), Ordering::Relaxed);
                break;
            }
            end = head;
            head = current;
        }
    }

    /// Registers `object` for finalization. Called right after the object is allocated.
    pub fn register_finalizee(&self, object: *mut u8, hub: &dyn Hub) {
        if !hub.has_finalizer() {
            crate::fatal!(
                "cannot register object {:p} of hub {} that has no finalizer",
                object,
                hub.id()
            );
        }
        self.finalizees.lock().push(Box::new(ReferenceObject::new(
            ReferenceKind::Final,
            object,
            null_mut(),
        )));
        logln_if!(
            self.trace,
            target: "references",
            "registered finalizer for {:p} of hub {}",
            object,
            hub.id()
        );
    }

    /// Discovers the registry's references whose finalizee has not died yet. Run by the
    /// daemon at the start of every collection.
    pub(crate) fn discover_finalizees(&self) {
        let finalizees = self.finalizees.lock();
        for reference in finalizees.iter().filter(|reference| reference.is_active()) {
            unsafe { self.discover(reference) };
        }
    }

    pub fn finalizee_count(&self) -> usize {
        self.finalizees.lock().len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.load(Ordering::Acquire).is_null()
    }

    /// Unlinks the whole pending list. The caller holds the lock.
    fn take_pending_locked(&self) -> Vec<*mut ReferenceObject> {
        let mut taken = vec![];
        let mut cursor = self.pending.swap(null_mut(), Ordering::AcqRel);
        while let Some(reference) = unsafe { cursor.as_ref() } {
            taken.push(cursor);
            let next = reference.next.load(Ordering::Acquire);
            // inactive from now on: the link points back at the reference itself
            reference.next.store(cursor, Ordering::Release);
            if next == cursor {
                break;
            }
            cursor = next;
        }
        taken
    }

    fn handle(&self, pending: Vec<*mut ReferenceObject>) {
        for reference in pending {
            let reference = unsafe { &*reference };
            if reference.kind() == ReferenceKind::Final {
                let object = reference.referent();
                reference.clear();
                self.handlers.finalizer.finalize(object);
                self.release_finalizee(reference);
            } else {
                self.handlers.queue.enqueue(reference);
            }
        }
    }

    fn release_finalizee(&self, reference: &ReferenceObject) {
        let mut finalizees = self.finalizees.lock();
        if let Some(position) = finalizees
            .iter()
            .position(|entry| ptr::eq(&**entry, reference))
        {
            finalizees.swap_remove(position);
        }
    }

    /// Hands every pending reference to its queue or finalizer on the calling thread.
    /// Returns the number of references handled.
    pub fn run_finalization(&self) -> usize {
        let pending = {
            let _guard = self.lock();
            self.take_pending_locked()
        };
        let count = pending.len();
        self.handle(pending);
        count
    }

    /// Wakes the reference handler. Called after every collection.
    pub(crate) fn notify_pending(&self) {
        let _guard = self.lock();
        self.pending_cv.notify_all();
    }

    fn handler_loop(&self) {
        loop {
            let pending = {
                let mut guard = self.lock();
                while !self.has_pending() && !self.shutdown.load(Ordering::Acquire) {
                    self.pending_cv.wait(&mut guard);
                }
                if !self.has_pending() {
                    return;
                }
                self.take_pending_locked()
            };
            logln_if!(
                self.trace,
                target: "references",
                "reference handler took {} pending references",
                pending.len()
            );
            self.handle(pending);
        }
    }
}

/// The always-live thread draining the pending list.
pub struct ReferenceHandler {
    manager: Arc<SpecialReferenceManager>,
    thread: Option<JoinHandle<()>>,
}

impl ReferenceHandler {
    pub fn start(manager: Arc<SpecialReferenceManager>) -> HeapResult<Self> {
        let handler = manager.clone();
        let thread = std::thread::Builder::new()
            .name("Reference Handler".into())
            .spawn(move || handler.handler_loop())
            .map_err(|source| HeapError::ThreadSpawn {
                name: "reference handler",
                source,
            })?;
        Ok(Self {
            manager,
            thread: Some(thread),
        })
    }

    /// Handles what is still pending and stops the thread.
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            {
                let _guard = self.manager.lock();
                self.manager.shutdown.store(true, Ordering::Release);
                self.manager.pending_cv.notify_all();
            }
            let _ = thread.join();
        }
    }
}

impl Drop for ReferenceHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::tests::TestHub;
    use std::{collections::HashSet, sync::mpsc, time::Duration};

    struct Tracer {
        live: HashSet<usize>,
        moved: Vec<(usize, usize)>,
        relocate: bool,
    }

    impl Tracer {
        fn new(live: &[usize]) -> Self {
            Self {
                live: live.iter().copied().collect(),
                moved: vec![],
                relocate: false,
            }
        }
    }

    impl ReferenceTracer for Tracer {
        fn is_reachable(&self, object: *mut u8) -> bool {
            self.live.contains(&(object as usize))
        }
        fn preserve(&mut self, object: *mut u8) -> *mut u8 {
            let to = object as usize + 0x1000;
            self.moved.push((object as usize, to));
            to as *mut u8
        }
        fn may_relocate_live_objects(&self) -> bool {
            self.relocate
        }
    }

    fn obj(addr: usize) -> *mut u8 {
        addr as *mut u8
    }

    const QUEUE: usize = 0x99;

    fn manager() -> SpecialReferenceManager {
        SpecialReferenceManager::new(ReferenceHandlers::default(), false)
    }

    #[test]
    fn references_are_discovered_once() {
        let manager = manager();
        let weak = ReferenceObject::new(ReferenceKind::Weak, obj(0x10), obj(QUEUE));
        let _guard = manager.lock();
        unsafe {
            manager.discover(&weak);
            manager.discover(&weak);
        }
        assert_eq!(manager.discovered.load(Ordering::Relaxed), weak.as_ptr());
        assert_eq!(weak.discovered.load(Ordering::Relaxed), manager.sentinel_ptr());
    }

    #[test]
    fn processing_clears_preserves_and_pends() {
        let manager = manager();
        let null_weak = ReferenceObject::new(ReferenceKind::Weak, null_mut(), obj(QUEUE));
        let dead_weak = ReferenceObject::new(ReferenceKind::Weak, obj(0x10), obj(QUEUE));
        let dead_final = ReferenceObject::new(ReferenceKind::Final, obj(0x20), null_mut());
        let live_soft = ReferenceObject::new(ReferenceKind::Soft, obj(0x30), obj(QUEUE));
        let no_queue = ReferenceObject::new(ReferenceKind::Weak, obj(0x40), null_mut());
        let mut tracer = Tracer::new(&[0x30]);

        let _guard = manager.lock();
        unsafe {
            for reference in [&null_weak, &dead_weak, &dead_final, &live_soft, &no_queue] {
                manager.discover(reference);
            }
        }
        manager.process_discovered(&mut tracer);

        assert!(null_weak.is_active());
        assert!(dead_weak.referent().is_null());
        assert!(!dead_weak.is_active());
        assert_eq!(dead_final.referent(), obj(0x1020));
        assert!(!dead_final.is_active());
        assert_eq!(live_soft.referent(), obj(0x30));
        assert!(live_soft.is_active());
        assert_eq!(no_queue.referent(), obj(0x40));
        assert!(no_queue.is_active());

        for reference in [&null_weak, &dead_weak, &dead_final, &live_soft, &no_queue] {
            assert!(!reference.is_discovered());
        }
        assert_eq!(manager.discovered.load(Ordering::Relaxed), manager.sentinel_ptr());

        // the discovered list runs backwards and pending prepends, so discovery order is kept
        let pending = manager.take_pending_locked();
        assert_eq!(pending, vec![dead_weak.as_ptr(), dead_final.as_ptr()]);
    }

    #[test]
    fn moving_collector_updates_live_referents() {
        let manager = manager();
        let weak = ReferenceObject::new(ReferenceKind::Weak, obj(0x50), obj(QUEUE));
        let mut tracer = Tracer::new(&[0x50]);
        tracer.relocate = true;
        let _guard = manager.lock();
        unsafe { manager.discover(&weak) };
        manager.process_discovered(&mut tracer);
        assert_eq!(weak.referent(), obj(0x1050));
        assert!(weak.is_active());
    }

    struct DiscoveringTracer<'a> {
        manager: &'a SpecialReferenceManager,
        late: &'a ReferenceObject,
        discovered_late: bool,
    }

    impl ReferenceTracer for DiscoveringTracer<'_> {
        fn is_reachable(&self, _object: *mut u8) -> bool {
            false
        }
        fn preserve(&mut self, object: *mut u8) -> *mut u8 {
            if !self.discovered_late {
                self.discovered_late = true;
                unsafe { self.manager.discover(self.late) };
            }
            object
        }
    }

    #[test]
    fn late_discoveries_are_processed_in_another_pass() {
        let manager = manager();
        let phantom = ReferenceObject::new(ReferenceKind::Phantom, obj(0x60), obj(QUEUE));
        let late = ReferenceObject::new(ReferenceKind::Weak, obj(0x70), obj(QUEUE));
        let _guard = manager.lock();
        unsafe { manager.discover(&phantom) };
        let mut tracer = DiscoveringTracer {
            manager: &manager,
            late: &late,
            discovered_late: false,
        };
        manager.process_discovered(&mut tracer);
        assert!(late.referent().is_null());
        assert!(!late.is_discovered());
        assert_eq!(
            manager.take_pending_locked(),
            vec![late.as_ptr(), phantom.as_ptr()]
        );
    }

    #[test]
    fn finalizees_are_finalized_once_dead() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let manager = SpecialReferenceManager::new(
            ReferenceHandlers {
                finalizer: Arc::new(move |object: *mut u8| {
                    let _ = tx.lock().send(object as usize);
                }),
                ..ReferenceHandlers::default()
            },
            false,
        );
        let hub = TestHub {
            finalizer: true,
            ..TestHub::tuple(1, 1)
        };
        manager.register_finalizee(obj(0x80), &hub);
        manager.register_finalizee(obj(0x90), &hub);
        {
            let _guard = manager.lock();
            manager.discover_finalizees();
            manager.process_discovered(&mut Tracer::new(&[0x90]));
        }
        assert_eq!(manager.run_finalization(), 1);
        assert_eq!(rx.try_recv(), Ok(0x1080));
        assert_eq!(manager.finalizee_count(), 1);
        assert!(!manager.has_pending());
    }

    #[test]
    fn handler_thread_drains_pending_list() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let manager = Arc::new(SpecialReferenceManager::new(
            ReferenceHandlers {
                queue: Arc::new(move |reference: &ReferenceObject| {
                    let _ = tx.lock().send(reference.kind());
                }),
                ..ReferenceHandlers::default()
            },
            false,
        ));
        let mut handler = ReferenceHandler::start(manager.clone()).unwrap();
        let weak = ReferenceObject::new(ReferenceKind::Weak, obj(0xa0), obj(QUEUE));
        {
            let _guard = manager.lock();
            unsafe { manager.discover(&weak) };
            manager.process_discovered(&mut Tracer::new(&[]));
        }
        manager.notify_pending();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(10)),
            Ok(ReferenceKind::Weak)
        );
        handler.shutdown();
        assert!(!manager.has_pending());
    }
}
