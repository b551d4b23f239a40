use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::hazard_manager::{HazardGuard, HazardManager};
use crate::util::WrappedAlign64Type;

/// Operation counters of a queue. All counters are relaxed and monotonic;
/// they exist for tests and observability, not for synchronization.
#[derive(Default)]
pub struct Statistics {
    constructed_nodes: AtomicUsize,
    destructed_nodes: AtomicUsize,
    successful_push: AtomicUsize,
    successful_pop: AtomicUsize,
    empty_pop: AtomicUsize,
    loop_iterations_push: AtomicUsize,
    loop_iterations_pop: AtomicUsize,
}

/// Plain copy of every counter at one moment.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatisticsSnapshot {
    pub constructed_nodes: usize,
    pub destructed_nodes: usize,
    pub successful_push: usize,
    pub successful_pop: usize,
    pub empty_pop: usize,
    pub loop_iterations_push: usize,
    pub loop_iterations_pop: usize,
    pub clearing_calls: usize,
}

type NodePtr<T> = *mut Node<T>;

/// Queue link. The sentinel carries `None`; every pushed node starts with
/// `Some` and has its value taken exactly once, by the pop that turns it
/// into the new sentinel. `stats` points into the queue's heap-pinned
/// counter block, which outlives every node.
struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: Option<T>,
    stats: *const Statistics,
}

impl<T> Node<T> {
    fn new(value: Option<T>, stats: &Statistics) -> NodePtr<T> {
        stats.constructed_nodes.fetch_add(1, Ordering::Relaxed);
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value,
            stats: stats as *const Statistics,
        }))
    }
}

impl<T> Drop for Node<T> {
    fn drop(&mut self) {
        unsafe {
            (*self.stats).destructed_nodes.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Michael & Scott non-blocking FIFO, unbounded, multi-producer and
/// multi-consumer. Lock-free but not wait-free: an operation may retry its
/// CAS loop under contention, but some thread always makes progress.
///
/// `head` always points at the sentinel; the nodes reachable from it are
/// the queue's contents; `tail` lags the real last node by at most one
/// link, and any thread finding it lagging helps swing it forward. Unlinked
/// sentinels are retired through a hazard guard and freed by the
/// reclamation engine once no thread can still observe them.
pub struct LockFreeQueue<T> {
    hazard_manager: Box<HazardManager>,
    stats: Box<Statistics>,
    head: WrappedAlign64Type<AtomicPtr<Node<T>>>,
    tail: WrappedAlign64Type<AtomicPtr<Node<T>>>,
}

// Values are handed across threads through the nodes, never shared.
unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> Default for LockFreeQueue<T> {
    fn default() -> Self {
        LockFreeQueue::new()
    }
}

impl<T> LockFreeQueue<T> {
    pub fn new() -> LockFreeQueue<T> {
        let stats = Box::new(Statistics::default());
        let sentinel = Node::new(None, &stats);
        LockFreeQueue {
            hazard_manager: HazardManager::new_in_heap(),
            stats,
            head: WrappedAlign64Type(AtomicPtr::new(sentinel)),
            tail: WrappedAlign64Type(AtomicPtr::new(sentinel)),
        }
    }

    /// Append `value`. The linearization point is the successful CAS of
    /// `tail.next` from null to the new node; swinging `tail` afterwards is
    /// best effort since any other thread completes it on demand.
    pub fn push(&self, value: T) {
        let new_node = Node::new(Some(value), &self.stats);
        let guard = HazardGuard::new(&self.hazard_manager);
        let mut loop_count = 0;
        loop {
            loop_count += 1;
            let tail = guard.protect(&*self.tail);
            // tail_next cannot change while tail is unchanged, so it needs
            // no guard of its own
            let tail_next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if !tail_next.is_null() {
                // another producer linked its node but has not swung the
                // tail yet; help it and retry
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    tail_next,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
            } else if unsafe {
                (*tail)
                    .next
                    .compare_exchange(
                        ptr::null_mut(),
                        new_node,
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            } {
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    new_node,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                self.stats
                    .loop_iterations_push
                    .fetch_add(loop_count, Ordering::Relaxed);
                self.stats.successful_push.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Remove the oldest value, or `None` when the queue is observed empty.
    /// Never blocks. The linearization point is the successful CAS of
    /// `head`; the old sentinel is then retired for deferred reclamation.
    pub fn pop(&self) -> Option<T> {
        // declared head, tail, next so scope exit releases the slots in
        // LIFO order
        let guard_head = HazardGuard::new(&self.hazard_manager);
        let guard_tail = HazardGuard::new(&self.hazard_manager);
        let guard_next = HazardGuard::new(&self.hazard_manager);
        let mut loop_count = 0;
        loop {
            loop_count += 1;
            let head = guard_head.protect(&*self.head);
            let tail = guard_tail.protect(&*self.tail);
            let head_next = guard_next.protect(unsafe { &(*head).next });

            if head == tail {
                if head_next.is_null() {
                    self.stats.empty_pop.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                // the tail lags behind the real last node; help the
                // producer and retry
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    head_next,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
            } else if self
                .head
                .compare_exchange(head, head_next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                // head_next is hazard-protected, so taking the value cannot
                // race with its reclamation
                let value = unsafe { (*head_next).value.take() };
                unsafe {
                    guard_head.retire::<Node<T>>();
                }
                self.stats
                    .loop_iterations_pop
                    .fetch_add(loop_count, Ordering::Relaxed);
                self.stats.successful_pop.fetch_add(1, Ordering::Relaxed);
                return value;
            }
        }
    }

    /// Whether the queue currently holds no value. A snapshot: concurrent
    /// producers may append before the caller acts on the answer.
    pub fn empty(&self) -> bool {
        let guard = HazardGuard::new(&self.hazard_manager);
        let head = guard.protect(&*self.head);
        unsafe { (*head).next.load(Ordering::Acquire).is_null() }
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            constructed_nodes: self.stats.constructed_nodes.load(Ordering::Relaxed),
            destructed_nodes: self.stats.destructed_nodes.load(Ordering::Relaxed),
            successful_push: self.stats.successful_push.load(Ordering::Relaxed),
            successful_pop: self.stats.successful_pop.load(Ordering::Relaxed),
            empty_pop: self.stats.empty_pop.load(Ordering::Relaxed),
            loop_iterations_push: self.stats.loop_iterations_push.load(Ordering::Relaxed),
            loop_iterations_pop: self.stats.loop_iterations_pop.load(Ordering::Relaxed),
            clearing_calls: self.hazard_manager.clearing_calls(),
        }
    }

    /// Records ever allocated by this queue's reclamation engine; stays
    /// bounded by peak thread concurrency thanks to record reuse.
    pub fn thread_record_count(&self) -> usize {
        self.hazard_manager.thread_record_count()
    }
}

impl<T> Drop for LockFreeQueue<T> {
    /// The queue must be destroyed by one thread after all others finished
    /// working with it: the reachable chain is freed here, the retired
    /// nodes by the manager's drop right after.
    fn drop(&mut self) {
        let mut curr = self.head.load(Ordering::Relaxed);
        while !curr.is_null() {
            unsafe {
                let next = (*curr).next.load(Ordering::Relaxed);
                drop(Box::from_raw(curr));
                curr = next;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    struct Counted<'a, T> {
        cnt: &'a RefCell<i32>,
        v: T,
    }

    impl<'a, T> Counted<'a, T> {
        fn new(cnt: &'a RefCell<i32>, v: T) -> Self {
            Counted { cnt, v }
        }
    }

    impl<'a, T> Drop for Counted<'a, T> {
        fn drop(&mut self) {
            *self.cnt.borrow_mut() += 1;
        }
    }

    #[test]
    fn test_base() {
        use crate::lockfree_queue::LockFreeQueue;

        let queue = LockFreeQueue::new();
        assert!(queue.empty());
        assert!(queue.pop().is_none());
        queue.push(1);
        assert!(!queue.empty());
        assert_eq!(queue.pop().unwrap(), 1);
        assert!(queue.empty());
        let test_num = 100;
        for i in 0..test_num {
            queue.push(i);
        }
        for i in 0..test_num {
            assert_eq!(queue.pop().unwrap(), i);
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_memory_leak() {
        use crate::lockfree_queue::LockFreeQueue;

        let cnt = RefCell::new(0);
        let queue = LockFreeQueue::new();
        let test_num = 100;
        for i in 0..test_num {
            queue.push(Counted::new(&cnt, i));
        }
        assert_eq!(*cnt.borrow(), 0);
        for i in 0..test_num {
            assert_eq!(queue.pop().unwrap().v, i);
        }
        assert_eq!(*cnt.borrow(), test_num);
        drop(queue);
        assert_eq!(*cnt.borrow(), test_num);
    }

    #[test]
    fn test_drop_releases_values() {
        use crate::lockfree_queue::LockFreeQueue;

        let cnt = RefCell::new(0);
        let queue = LockFreeQueue::new();
        let test_num = 50;
        for i in 0..test_num {
            queue.push(Counted::new(&cnt, i));
        }
        for _ in 0..test_num / 2 {
            queue.pop().unwrap();
        }
        assert_eq!(*cnt.borrow(), test_num / 2);
        drop(queue);
        assert_eq!(*cnt.borrow(), test_num);
    }

    #[test]
    fn test_statistics() {
        use crate::lockfree_queue::LockFreeQueue;

        let queue = LockFreeQueue::new();
        let before = queue.statistics();
        assert_eq!(before.constructed_nodes, 1); // sentinel
        assert_eq!(before.successful_push, 0);

        for i in 0..10 {
            queue.push(i);
        }
        for _ in 0..10 {
            queue.pop().unwrap();
        }
        assert!(queue.pop().is_none());

        let after = queue.statistics();
        assert_eq!(after.successful_push, 10);
        assert_eq!(after.successful_pop, 10);
        assert_eq!(after.empty_pop, 1);
        assert_eq!(after.constructed_nodes, 11);
        assert!(after.loop_iterations_push >= 10);
        assert!(after.loop_iterations_pop >= 10);
    }

    #[test]
    fn test_empty_cycle() {
        use crate::lockfree_queue::LockFreeQueue;

        let queue = LockFreeQueue::new();
        for round in 0..3 {
            assert!(queue.empty());
            for i in 0..16 {
                queue.push(round * 16 + i);
            }
            assert!(!queue.empty());
            for i in 0..16 {
                assert_eq!(queue.pop().unwrap(), round * 16 + i);
            }
            assert!(queue.empty());
        }
    }
}
