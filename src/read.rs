use crate::sync::{fence, Arc, AtomicU8, Ordering};
use crate::{slot_locked, Shared};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;

/// A registered reader of an RCU-protected value, obtained from
/// [`Rcu::reader`](crate::Rcu::reader).
///
/// Each `Reader` owns one slot in the container's quiescence registry.
/// Cloning registers an independent slot, so every thread that reads should
/// hold its own `Reader`. The slot is deregistered when the `Reader` drops.
///
/// A `Reader` can only move to another thread when `T` is `Sync`:
///
/// ```compile_fail
/// use std::cell::RefCell;
///
/// let rcu = coalesce_rcu::Rcu::new(RefCell::new(0));
/// let mut reader = rcu.reader();
/// std::thread::spawn(move || {
///     let _ = reader.read();
/// });
/// ```
pub struct Reader<T: 'static> {
    shared: Arc<Shared<T>>,
    /// This reader's slot. Also referenced from the registry, where the
    /// writer's scan finds it.
    slot: Arc<AtomicU8>,
    /// Index in the registry, used to deregister on drop.
    key: usize,
    // pointer used so we get !Send/!Sync without the `unsafe impl`s below.
    _marker: PhantomData<*const T>,
}

// SAFETY: if `T` is not `Sync` (ie: it is a RefCell or has other
// non-thread-safe mutability), the reader must stay on the thread that can
// already reach the value through the update side.
unsafe impl<T: Send + Sync> Send for Reader<T> {}
unsafe impl<T: Send + Sync> Sync for Reader<T> {}

impl<T> Clone for Reader<T> {
    fn clone(&self) -> Reader<T> {
        Reader::new(self.shared.clone())
    }
}

impl<T> fmt::Debug for Reader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("slot", &self.slot.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> Reader<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>) -> Reader<T> {
        let slot = Arc::new(AtomicU8::new(0));
        let key = shared.slots.lock().unwrap().insert(slot.clone());

        Reader {
            shared,
            slot,
            key,
            _marker: PhantomData,
        }
    }

    /// Enter a read-side critical section and borrow the current version.
    ///
    /// The snapshot stays consistent for the lifetime of the returned
    /// [`ReadGuard`]; dropping the guard is the read-unlock. Acquiring is
    /// wait free and never synchronizes with other readers.
    ///
    /// Holding a guard pins every version retired since it was taken, so
    /// keep read-side critical sections short.
    ///
    /// The borrow checker rules out overlapping guards from one `Reader`:
    ///
    /// ```compile_fail
    /// let rcu = coalesce_rcu::Rcu::new(0u32);
    /// let mut reader = rcu.reader();
    /// let first = reader.read();
    /// let second = reader.read();
    /// assert_eq!(*first, *second);
    /// ```
    pub fn read(&mut self) -> ReadGuard<'_, T> {
        // Capture the epoch and mark this reader active. The slot store is
        // relaxed; stale values only delay reclamation, never unblock it.
        let epoch = self.shared.epoch.load(Ordering::Relaxed);
        self.slot.store(slot_locked(epoch), Ordering::Relaxed);

        // Pairs with the fence the writer issues between publishing a new
        // version and scanning the slots: either the scan observes our slot
        // as locked, or we observe the freshly published version, which is
        // not on the retire list under test.
        fence(Ordering::SeqCst);

        // Pairs with the Release exchange in the publication path, so every
        // write the elected writer made to this version is visible.
        let data = self.shared.active.load(Ordering::Acquire);

        ReadGuard {
            reader: self,
            // SAFETY: our slot is locked under the captured epoch, so the
            // writer cannot reclaim the version behind `data` until the
            // slot is cleared, which only `ReadGuard::drop` does.
            data: unsafe { &*data },
        }
    }
}

impl<T> Drop for Reader<T> {
    fn drop(&mut self) {
        self.shared.slots.lock().unwrap().remove(self.key);
    }
}

/// Scoped borrow of the protected value; dropping it is the read-unlock.
pub struct ReadGuard<'a, T: 'static> {
    reader: &'a mut Reader<T>,
    data: &'a T,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<T: fmt::Debug> fmt::Debug for ReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReadGuard").field(self.data).finish()
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        // Release keeps the reads done through this guard from sinking
        // below the store that lets the writer reclaim the version.
        self.reader.slot.store(0, Ordering::Release);
    }
}
