use std::cell::RefCell;
use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::Status;
use crate::hazard_pointer::{
    HazardSlot, RetiredPtr, ThreadRecord, MAX_HAZARDS_PER_THREAD, MAX_THREAD_COUNT,
};
use crate::util;

struct RegistryEntry {
    /// Manager address; identity only, never dereferenced.
    manager: usize,
    record: *mut ThreadRecord,
    destructed: Arc<AtomicBool>,
}

/// Thread-exit hook. Dropping the registry releases every record the
/// exiting thread owns so the next arriving thread can adopt it; records
/// whose manager is already gone are skipped (on some platforms
/// thread-local destructors outlive static/managed state, the shared flag
/// covers that ordering).
struct ThreadRegistry {
    entries: Vec<RegistryEntry>,
}

impl Drop for ThreadRegistry {
    fn drop(&mut self) {
        for entry in &self.entries {
            if !entry.destructed.load(Ordering::Acquire) {
                unsafe {
                    (*entry.record).abandon();
                }
            }
        }
    }
}

thread_local! {
    static REGISTRY: RefCell<ThreadRegistry> = RefCell::new(ThreadRegistry {
        entries: Vec::new(),
    });
}

/// Owner of the global `ThreadRecord` list: assigns a stable record to
/// every participating thread and snapshots the set of currently protected
/// pointers for the retired-list sweeps.
///
/// Threads cache their record keyed by the manager's address, so a manager
/// must not move while in use. Construct it through `new_in_heap`, or keep
/// a `new_in_stack` value pinned for its whole life.
pub struct HazardManager {
    head: AtomicPtr<ThreadRecord>,
    record_count: AtomicUsize,
    clearing_calls: AtomicUsize,
    destructed: Arc<AtomicBool>,
}

impl HazardManager {
    pub fn new_in_heap() -> Box<HazardManager> {
        Box::new(unsafe { HazardManager::new_in_stack() })
    }

    /// # Safety
    ///
    /// The returned value must not move between the first `HazardGuard`
    /// created on it and its drop.
    pub unsafe fn new_in_stack() -> HazardManager {
        HazardManager {
            head: AtomicPtr::new(ptr::null_mut()),
            record_count: AtomicUsize::new(0),
            clearing_calls: AtomicUsize::new(0),
            destructed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of times any thread ran a retired-list sweep.
    #[inline]
    pub fn clearing_calls(&self) -> usize {
        self.clearing_calls.load(Ordering::Relaxed)
    }

    /// Number of records ever allocated. Bounded by peak thread concurrency,
    /// not by how many threads ever participated, thanks to record reuse.
    #[inline]
    pub fn thread_record_count(&self) -> usize {
        self.record_count.load(Ordering::Relaxed)
    }

    /// The calling thread's record: cached, else adopted from an abandoned
    /// record, else freshly allocated and prepended to the global list.
    fn thread_record(&self) -> *mut ThreadRecord {
        let key = self as *const HazardManager as usize;
        REGISTRY.with(|registry| {
            let mut registry = registry.borrow_mut();
            registry
                .entries
                .retain(|e| !e.destructed.load(Ordering::Acquire));
            if let Some(entry) = registry.entries.iter().find(|e| e.manager == key) {
                return entry.record;
            }
            let record = self.adopt_or_allocate();
            registry.entries.push(RegistryEntry {
                manager: key,
                record,
                destructed: self.destructed.clone(),
            });
            record
        })
    }

    fn adopt_or_allocate(&self) -> *mut ThreadRecord {
        let mut iter = self.head.load(Ordering::Acquire);
        while !iter.is_null() {
            let record = unsafe { &*iter };
            if !record.is_in_use() && record.try_adopt() {
                debug!(
                    "thread {} adopted an abandoned record with {} pending retirements",
                    util::get_thread_id(),
                    record.retired_count()
                );
                return iter;
            }
            iter = record.next();
        }

        let count = self.record_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count > MAX_THREAD_COUNT {
            warn!(
                "{}: {} records allocated, retired buffers sized for {} threads",
                Status::TooManyThreads,
                count,
                MAX_THREAD_COUNT
            );
        }
        debug!("thread {} allocated record {}", util::get_thread_id(), count);

        let record = Box::into_raw(Box::new(ThreadRecord::new()));
        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe {
                (*record).set_next(head);
            }
            if self
                .head
                .compare_exchange_weak(head, record, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return record;
            }
        }
    }

    /// Snapshot of every pointer currently sitting in an occupied hazard
    /// slot. Consistency is not required; any pointer protected when the
    /// scan started is guaranteed to appear.
    pub fn collect_hazards(&self) -> HashSet<*mut ()> {
        let mut live = HashSet::new();
        let mut iter = self.head.load(Ordering::Acquire);
        while !iter.is_null() {
            let record = unsafe { &*iter };
            if record.is_in_use() {
                for slot in record.hazards() {
                    if !slot.is_free() {
                        live.insert(slot.protected());
                    }
                }
            }
            iter = record.next();
        }
        live
    }

    /// Retired-list sweep for `record`.
    ///
    /// # Safety
    ///
    /// Must run on the thread owning `record`.
    unsafe fn clear_retired(&self, record: &ThreadRecord) {
        self.clearing_calls.fetch_add(1, Ordering::Relaxed);
        let live = self.collect_hazards();
        let freed = record.sweep_retired(&live);
        debug!(
            "sweep on thread {} reclaimed {}, kept {}",
            util::get_thread_id(),
            freed,
            record.retired_count()
        );
    }
}

impl Drop for HazardManager {
    /// Assumes no thread still uses the manager: every retired pointer is
    /// force-freed and every record deleted. The shared flag suppresses the
    /// thread-exit hooks of threads that outlive the manager.
    fn drop(&mut self) {
        self.destructed.store(true, Ordering::Release);
        let mut iter = self.head.load(Ordering::Acquire);
        while !iter.is_null() {
            unsafe {
                let next = (*iter).next();
                (*iter).force_free_retired();
                drop(Box::from_raw(iter));
                iter = next;
            }
        }
    }
}

/// Scoped reservation of one hazard slot on the calling thread's record.
///
/// A guard pins at most one pointer at a time: `protect` publishes a
/// snapshot of an atomic source that stays dereferenceable until the guard
/// is dropped, retired or overwritten by another `protect`. Guards nest but
/// must be dropped in reverse creation order on each thread, which scoping
/// gives naturally.
pub struct HazardGuard<'a> {
    manager: &'a HazardManager,
    record: *mut ThreadRecord,
    slot_index: usize,
}

impl<'a> HazardGuard<'a> {
    /// Reserves a slot; aborts with `CapacityExceeded` when the calling
    /// thread already holds `MAX_HAZARDS_PER_THREAD` live guards.
    pub fn new(manager: &'a HazardManager) -> HazardGuard<'a> {
        let record = manager.thread_record();
        let slot_index = unsafe { (*record).acquire_hazard() }.unwrap_or_else(|| {
            panic!(
                "{}: more than {} hazard guards live on one thread",
                Status::CapacityExceeded,
                MAX_HAZARDS_PER_THREAD
            )
        });
        HazardGuard {
            manager,
            record,
            slot_index,
        }
    }

    #[inline]
    fn slot(&self) -> &HazardSlot {
        unsafe { (*self.record).hazard(self.slot_index) }
    }

    /// Publish and return a snapshot of `source` that is safe to dereference
    /// for the guard's remaining lifetime, provided the pointer was still
    /// reachable from a shared location at some moment during the call.
    ///
    /// The slot store and the validating reload close the window in which a
    /// concurrent sweep could have collected hazards after the load but
    /// before the announcement; a single plain store would not.
    pub fn protect<N>(&self, source: &AtomicPtr<N>) -> *mut N {
        let slot = self.slot();
        loop {
            let ptr = source.load(Ordering::SeqCst);
            slot.set_protected(ptr as *mut ());
            if ptr == source.load(Ordering::SeqCst) {
                return ptr;
            }
        }
    }

    /// Hand the currently protected pointer over to the thread's retired
    /// buffer; it is freed by a later sweep once no slot protects it. A full
    /// buffer triggers a sweep first; aborts with `RetireOverflow` when even
    /// that frees no room.
    ///
    /// # Safety
    ///
    /// The slot must hold a pointer obtained from `protect::<N>` that has
    /// been unlinked from every shared location, was allocated through
    /// `Box<N>`, and is retired by no other thread.
    pub unsafe fn retire<N>(&self) {
        let retired = RetiredPtr::new(self.slot().protected() as *mut N);
        if !(*self.record).try_add_retired(retired) {
            self.manager.clear_retired(&*self.record);
            if !(*self.record).try_add_retired(retired) {
                panic!(
                    "{}: retired buffer still full after sweep",
                    Status::RetireOverflow
                );
            }
        }
    }
}

impl Drop for HazardGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            (*self.record).release_hazard(self.slot_index);
        }
    }
}

#[cfg(test)]
mod test {
    use crate::hazard_manager::{HazardGuard, HazardManager};
    use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    struct Tracked {
        live: Arc<AtomicUsize>,
    }

    impl Tracked {
        fn new(live: &Arc<AtomicUsize>) -> *mut Tracked {
            live.fetch_add(1, Ordering::Relaxed);
            Box::into_raw(Box::new(Tracked { live: live.clone() }))
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_protect_snapshots_source() {
        let manager = HazardManager::new_in_heap();
        let live = Arc::new(AtomicUsize::new(0));
        let shared = AtomicPtr::new(Tracked::new(&live));

        let guard = HazardGuard::new(&manager);
        let seen = guard.protect(&shared);
        assert_eq!(seen, shared.load(Ordering::SeqCst));
        assert!(manager.collect_hazards().contains(&(seen as *mut ())));

        drop(guard);
        assert!(manager.collect_hazards().is_empty());

        unsafe {
            drop(Box::from_raw(shared.load(Ordering::SeqCst)));
        }
        drop(manager);
        assert_eq!(live.load(Ordering::Relaxed), 0);
    }

    #[test]
    #[should_panic(expected = "CapacityExceeded")]
    fn test_guard_capacity() {
        let manager = HazardManager::new_in_heap();
        let _a = HazardGuard::new(&manager);
        let _b = HazardGuard::new(&manager);
        let _c = HazardGuard::new(&manager);
        let _d = HazardGuard::new(&manager);
    }

    #[test]
    fn test_retire_frees_on_manager_drop() {
        let manager = HazardManager::new_in_heap();
        let live = Arc::new(AtomicUsize::new(0));
        let shared = AtomicPtr::new(Tracked::new(&live));

        for _ in 0..64 {
            let guard = HazardGuard::new(&manager);
            let old = guard.protect(&shared);
            shared.store(Tracked::new(&live), Ordering::SeqCst);
            unsafe {
                guard.retire::<Tracked>();
            }
            let _ = old;
        }
        assert!(live.load(Ordering::Relaxed) >= 1);

        unsafe {
            drop(Box::from_raw(shared.load(Ordering::SeqCst)));
        }
        drop(manager);
        assert_eq!(live.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_reuse_across_threads() {
        let manager = Arc::new(HazardManager::new_in_heap());
        for _ in 0..8 {
            let m = manager.clone();
            thread::spawn(move || {
                let guard = HazardGuard::new(&m);
                let shared = AtomicPtr::new(Box::into_raw(Box::new(1_u32)));
                let seen = guard.protect(&shared);
                unsafe {
                    drop(Box::from_raw(seen));
                }
            })
            .join()
            .unwrap();
        }
        // every generation reused the record the previous one abandoned
        assert_eq!(manager.thread_record_count(), 1);
    }
}
