//! Write-biased RCU: one protected value, wait-free readers, and contended
//! writers that elect a single publisher among themselves.
//!
//! A [`Rcu<T>`] guards a single heap-allocated `T`. Readers obtain a scoped
//! snapshot through a [`ReadGuard`]; writers hand in closures via
//! [`Rcu::update`]. Old versions of the value are parked on epoch-segregated
//! retire lists and recycled into an object pool once no reader can still
//! observe them, so a steady stream of updates settles into zero allocation.
//!
//! - Reading is wait free: one relaxed load of the epoch bit, one relaxed
//!   store to a thread-confined reader slot, one `Acquire` load of the
//!   version pointer. No read-modify-write, no cache-line bouncing between
//!   readers.
//! - Updating elects a writer. The first thread to bump the update counter
//!   from zero becomes the publisher; everyone else enqueues a closure and
//!   returns. The elected writer drains the queue into a private copy and
//!   publishes with a `Release` exchange, so concurrent updates coalesce
//!   into few publications.
//! - Reclamation is deferred. A displaced version is retired under the
//!   current epoch bit; the writer frees the *previous* epoch's retirees
//!   only after a scan of all reader slots proves that epoch quiescent,
//!   then flips the epoch. Freed slots feed the copy pool.
//!
//! The trade-offs: updates are asynchronous under contention (an enqueued
//! closure runs on whichever thread holds the election), memory is not
//! bounded while a reader stalls inside a read-side critical section, and
//! `T` must be `Clone` so the writer can produce private copies.
//!
//! ```
//! let rcu = coalesce_rcu::Rcu::new(0u64);
//!
//! let writer = rcu.clone();
//! std::thread::spawn(move || writer.update(|v| *v += 1))
//!     .join()
//!     .unwrap();
//!
//! let mut reader = rcu.reader();
//! assert_eq!(*reader.read(), 1);
//! ```
#![warn(missing_docs, rust_2018_idioms, missing_debug_implementations)]

mod sync;

use crate::sync::{fence, Arc, AtomicPtr, AtomicU64, AtomicU8, Mutex, Ordering};
use std::cell::UnsafeCell;
use std::fmt;

mod read;
pub use crate::read::{ReadGuard, Reader};

mod write;
use crate::write::WriterState;

/// A boxed update waiting in the queue for the elected writer.
pub(crate) type Update<T> = Box<dyn FnOnce(&mut T) + Send>;

/// Per-reader slots, scanned by the elected writer to test quiescence.
///
/// Locked when a reader registers or deregisters and for the duration of a
/// quiescence scan. The read fast path never touches the lock.
pub(crate) type ReaderSlots = Mutex<slab::Slab<Arc<AtomicU8>>>;

/// Slot value of a reader inside a read-side critical section entered while
/// the epoch bit held `epoch`. A slot value of 0 means "not reading".
pub(crate) fn slot_locked(epoch: u8) -> u8 {
    (epoch << 1) | 1
}

/// Tunables for a [`Rcu`].
///
/// Every field is floor-clamped to 1 at construction, so a zero (from, say,
/// a miscomputed per-node share of the CPU count) degrades to the most
/// eager setting instead of disabling reclamation.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Closures the elected writer applies to one private copy before it
    /// must publish. Bounds how stale a reader's snapshot can get while a
    /// burst of updaters keeps the queue non-empty.
    pub flush_threshold: u64,
    /// Retirements accumulated in the current epoch before the writer
    /// probes the previous epoch for quiescence. Lower reclaims sooner but
    /// scans the reader slots more often.
    pub cleanup_threshold: usize,
    /// Capacity of the pending-update queue. Enqueueing writers block while
    /// it is full, so size it well above any realistic burst.
    pub queue_capacity: usize,
}

impl Default for Options {
    /// `flush_threshold` 20, `cleanup_threshold` equal to the number of
    /// CPUs, `queue_capacity` 500 per CPU.
    fn default() -> Options {
        let hw = num_cpus::get();
        Options {
            flush_threshold: 20,
            cleanup_threshold: hw,
            queue_capacity: 500 * hw,
        }
    }
}

impl Options {
    fn clamped(self) -> Options {
        Options {
            flush_threshold: self.flush_threshold.max(1),
            cleanup_threshold: self.cleanup_threshold.max(1),
            queue_capacity: self.queue_capacity.max(1),
        }
    }
}

/// Shared state behind every handle to one protected value.
pub(crate) struct Shared<T: 'static> {
    /// Currently published version. Really a `Box<T>`, held as an
    /// `AtomicPtr` so readers can load it and the writer can exchange it.
    pub(crate) active: AtomicPtr<T>,

    /// Epoch bit, 0 or 1. Selects which retire list collects new
    /// retirements; readers capture it into their slot on lock.
    pub(crate) epoch: AtomicU8,

    /// Registered reader slots.
    pub(crate) slots: ReaderSlots,

    /// Outstanding updates since the last election. The 0 -> 1 transition
    /// elects the incrementing thread; the elected writer steps down by a
    /// CAS back to 0 once it has executed everything it observed.
    pub(crate) update_cnt: AtomicU64,

    /// Pending closures from threads that lost the election. Only the
    /// elected writer dequeues.
    pub(crate) tx: crossbeam_channel::Sender<Update<T>>,
    pub(crate) rx: crossbeam_channel::Receiver<Update<T>>,

    /// Retire lists and the copy pool. Exclusively owned by the elected
    /// writer between its winning fetch-add and its CAS back to zero.
    pub(crate) writer: UnsafeCell<WriterState<T>>,

    pub(crate) opts: Options,
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // SAFETY: no handle to this `Shared` exists any more, so no reader
        // borrow and no elected writer is in flight. The active pointer was
        // produced by `Box::into_raw` at construction or publication.
        drop(unsafe { Box::from_raw(self.active.load(Ordering::Relaxed)) });
        // Retired versions and the pool are owned boxes inside `writer` and
        // drop with it, as do any closures still sitting in the queue.
    }
}

/// A handle to an RCU-protected value.
///
/// `Rcu` is cheap to clone; clones address the same protected value. Share
/// clones between threads and call [`update`](Rcu::update) from any of
/// them. Reading goes through a per-thread [`Reader`] obtained from
/// [`reader`](Rcu::reader).
///
/// The protected value is destroyed, along with every retired and pooled
/// copy, when the last handle (and every `Reader`) is gone.
pub struct Rcu<T: 'static> {
    shared: Arc<Shared<T>>,
}

// If `T` is not Sync, handles must not cross threads: a reader on another
// thread would alias a value the update closures mutate through `&mut`.
unsafe impl<T: Send + Sync> Send for Rcu<T> {}
unsafe impl<T: Send + Sync> Sync for Rcu<T> {}

impl<T> Clone for Rcu<T> {
    fn clone(&self) -> Rcu<T> {
        Rcu {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Rcu<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rcu")
            .field(
                "pending_updates",
                &self.shared.update_cnt.load(Ordering::Relaxed),
            )
            .field("epoch", &self.shared.epoch.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> Rcu<T> {
    /// Protect `value` with the default [`Options`].
    pub fn new(value: T) -> Rcu<T> {
        Rcu::with_options(value, Options::default())
    }

    /// Protect `value` with explicit tunables.
    pub fn with_options(value: T, opts: Options) -> Rcu<T> {
        let opts = opts.clamped();
        let (tx, rx) = crossbeam_channel::bounded(opts.queue_capacity);
        Rcu {
            shared: Arc::new(Shared {
                active: AtomicPtr::new(Box::into_raw(Box::new(value))),
                epoch: AtomicU8::new(0),
                slots: Mutex::new(slab::Slab::new()),
                update_cnt: AtomicU64::new(0),
                tx,
                rx,
                writer: UnsafeCell::new(WriterState::new()),
                opts,
            }),
        }
    }

    /// Register a reader for the protected value.
    ///
    /// Registration takes the reader-slot lock and so may briefly contend
    /// with the writer's quiescence scan; create readers up front rather
    /// than per read.
    pub fn reader(&self) -> Reader<T> {
        Reader::new(self.shared.clone())
    }

    /// Apply `f` to the protected value and publish the result.
    ///
    /// If no other update is in flight the calling thread is elected as the
    /// writer: it runs `f` on a private copy of the current value, then
    /// drains any concurrently enqueued closures, publishing along the way,
    /// and returns once everything it observed has been applied. Otherwise
    /// `f` is enqueued for the currently elected writer and `update`
    /// returns immediately; the closure runs, exactly once, on that
    /// writer's thread before it releases the election.
    ///
    /// Closure effects become visible to readers at the next publication.
    /// Calling `update` from inside an update closure is fine and enqueues
    /// the inner closure for the same writer turn. Blocks while the pending
    /// queue is at capacity.
    ///
    /// # Panics
    ///
    /// If `f` (or any enqueued closure the elected writer executes) panics,
    /// the panic propagates on the executing thread and the container stops
    /// applying updates: the election is never released, so later calls
    /// enqueue closures that no one will run. Reads stay valid and keep
    /// returning the last published version.
    pub fn update<F>(&self, f: F)
    where
        T: Clone,
        F: FnOnce(&mut T) + Send + 'static,
    {
        if self.shared.update_cnt.fetch_add(1, Ordering::Relaxed) == 0 {
            // Elected. The fence pairs with the Release CAS that zeroed the
            // counter when the previous writer released the election, so
            // everything it did to the writer state is visible here.
            fence(Ordering::Acquire);

            // SAFETY: the 0 -> 1 transition makes this thread the unique
            // elected writer until its CAS back to zero.
            let mut copied = unsafe { self.shared.get_copy() };
            f(&mut *copied);
            // SAFETY: as above; `drain` performs the CAS that releases the
            // election before returning.
            unsafe { self.shared.drain(copied) };
        } else {
            // Somebody else holds the election. Hand the closure over; the
            // counter increment above commits us to this send, and the
            // elected writer will block on the queue until it arrives.
            self.shared
                .tx
                .send(Box::new(f))
                .expect("queue outlives all handles");
        }
    }
}
