//! Lock-free MPMC FIFO queue built on the `Hazard Pointers` reclamation algorithm
//!
//! [`Hazard Pointers`](http://www.cs.otago.ac.nz/cosc440/readings/hazard-pointers.pdf)
//! let a thread announce the shared pointers it is about to dereference by
//! publishing them into per-thread slots that every other thread can read.
//! A pointer unlinked from a shared structure is not freed immediately; it is
//! parked in the unlinking thread's retired buffer and released only once no
//! slot in the whole process still holds it. This removes the use-after-free
//! and [`ABA`](https://en.wikipedia.org/wiki/ABA_problem) hazards of lock-free
//! structures without reference counting on the hot path.
//!
//! `HazardManager` owns the process-wide list of per-thread records and hands
//! out scoped `HazardGuard`s; `LockFreeQueue` is a Michael & Scott FIFO that
//! uses the guards to make unlinked head nodes safe to reclaim. Threads may
//! `push` and `pop` concurrently without locks; a thread that exits leaves its
//! record behind for the next arriving thread to reuse.

pub mod util;
pub mod error;
pub mod hazard_pointer;
pub mod hazard_manager;
pub mod lockfree_queue;

#[macro_use]
extern crate log;
