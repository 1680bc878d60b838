use crate::sync::{fence, Ordering};
use crate::{slot_locked, Shared};
use std::mem;

/// Retire lists and the copy pool.
///
/// Owned by whichever thread currently holds the election; the update
/// counter's 0 -> 1 / CAS-to-0 protocol stands in for a lock.
pub(crate) struct WriterState<T> {
    /// `retired[e]` holds versions displaced while the epoch bit was `e`.
    /// The list for the previous epoch may only be recycled after a scan
    /// shows no reader slot still locked under that epoch.
    retired: [Vec<Box<T>>; 2],
    /// Reclaimed boxes awaiting reuse by copy production.
    pool: Vec<Box<T>>,
}

impl<T> WriterState<T> {
    pub(crate) fn new() -> WriterState<T> {
        WriterState {
            retired: [Vec::new(), Vec::new()],
            pool: Vec::new(),
        }
    }
}

impl<T> Shared<T> {
    /// Park `old` on the current retire list and recycle the previous
    /// epoch's list if it has gone quiescent.
    ///
    /// Called by the elected writer after each publication.
    fn retire(&self, state: &mut WriterState<T>, old: Box<T>) {
        let curr = usize::from(self.epoch.load(Ordering::Relaxed));
        let prev = curr ^ 1;
        state.retired[curr].push(old);

        if state.retired[curr].len() < self.opts.cleanup_threshold
            || !self.epoch_is_clear(prev as u8)
        {
            return;
        }

        // Every reader that locked under the previous epoch has left, and
        // a new lock can only capture the current epoch, so the previous
        // list is unreachable. Recycle it into the pool (dropping whatever
        // the pool still held) and flip the epoch.
        mem::swap(&mut state.pool, &mut state.retired[prev]);
        state.retired[prev].clear();
        self.epoch.store(prev as u8, Ordering::Relaxed);
    }

    /// True iff no reader slot is locked under `epoch`.
    ///
    /// A stale `0` in a slot is fine: the reader has in fact exited and its
    /// unlock store is just not visible yet. A stale locked value only
    /// delays reclamation.
    fn epoch_is_clear(&self, epoch: u8) -> bool {
        // Pairs with the fence between a reader's slot store and its
        // version load: a reader this scan fails to observe is guaranteed
        // to observe the version published above instead of one on the
        // list being reclaimed.
        fence(Ordering::SeqCst);

        let locked = slot_locked(epoch);
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .all(|(_, slot)| slot.load(Ordering::Relaxed) != locked)
    }
}

impl<T: Clone> Shared<T> {
    /// Produce a private copy of the current version, reusing a pooled box
    /// when one is available.
    ///
    /// # Safety
    ///
    /// Caller must hold the election; the writer state is unguarded.
    pub(crate) unsafe fn get_copy(&self) -> Box<T> {
        self.copy_current(unsafe { &mut *self.writer.get() })
    }

    fn copy_current(&self, state: &mut WriterState<T>) -> Box<T> {
        // Only the elected writer replaces the pointer, so Relaxed is
        // enough and the borrow cannot dangle.
        let curr = unsafe { &*self.active.load(Ordering::Relaxed) };
        match state.pool.pop() {
            Some(mut copied) => {
                (*copied).clone_from(curr);
                copied
            }
            None => Box::new(curr.clone()),
        }
    }

    /// The elected writer's turn: execute queued updates against `copied`,
    /// publish, retire, and try to step down.
    ///
    /// `copied` already reflects the elector's own update, which counts as
    /// the first completed one.
    ///
    /// # Safety
    ///
    /// Caller must hold the election. `drain` releases it (the CAS back to
    /// zero) before returning.
    pub(crate) unsafe fn drain(&self, mut copied: Box<T>) {
        let state = unsafe { &mut *self.writer.get() };

        let mut done: u64 = 1;
        let mut update_cnt = self.update_cnt.load(Ordering::Relaxed);

        loop {
            let mut unflushed: u64 = 0;
            loop {
                while done < update_cnt {
                    // Whoever bumped the counter past `done` is committed
                    // to a send, so this receive always completes.
                    let update =
                        self.rx.recv().expect("queue outlives all handles");
                    update(&mut *copied);
                    done += 1;
                    unflushed += 1;
                    if unflushed == self.opts.flush_threshold {
                        break;
                    }
                }

                // Publish a partial batch rather than let a steady stream
                // of enqueuers starve readers of fresh versions.
                if unflushed == self.opts.flush_threshold {
                    break;
                }
                update_cnt = self.update_cnt.load(Ordering::Relaxed);
                if done == update_cnt {
                    break;
                }
            }

            // Pairs with the Acquire load on the read path: everything the
            // closures wrote to `copied` is visible to readers of it.
            let old = self.active.swap(Box::into_raw(copied), Ordering::Release);
            // SAFETY: `old` came out of `Box::into_raw` at construction or
            // at a previous publication and no new reader can reach it. The
            // box is not dropped until the quiescence test says so.
            self.retire(state, unsafe { Box::from_raw(old) });

            if done == update_cnt {
                // Step down. Success (Release) hands the writer state to
                // the next elector, which synchronizes with its Acquire
                // fence. Failure means more updates arrived since we last
                // looked, and the observed value tells us how many.
                match self.update_cnt.compare_exchange(
                    update_cnt,
                    0,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(observed) => update_cnt = observed,
                }
            }

            copied = self.copy_current(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::write::WriterState;
    use crate::{Options, Rcu, Shared};

    fn small(cleanup_threshold: usize) -> Options {
        Options {
            flush_threshold: 20,
            cleanup_threshold,
            queue_capacity: 16,
        }
    }

    impl<T> Shared<T> {
        /// Peek at the writer state. Only sound while no update is in
        /// flight, which single-threaded tests guarantee.
        fn peek(&self) -> &WriterState<T> {
            unsafe { &*self.writer.get() }
        }
    }

    #[test]
    fn pool_refills_once_epochs_turn_over() {
        let rcu = Rcu::with_options(0usize, small(2));
        for i in 1..=50 {
            rcu.update(move |v| *v = i);
        }
        assert_eq!(*rcu.reader().read(), 50);

        let state = rcu.shared.peek();
        assert!(state.pool.len() >= 1);
        // Steady state keeps only a few boxes alive regardless of the
        // number of updates performed.
        let retained: usize =
            state.pool.len() + state.retired[0].len() + state.retired[1].len();
        assert!(retained <= 5, "retained {retained} boxes");
    }

    #[test]
    fn reclamation_waits_for_readers_of_the_previous_epoch() {
        let rcu = Rcu::with_options(0u32, small(1));
        let mut reader = rcu.reader();
        let guard = reader.read();

        for i in 1..=5 {
            rcu.update(move |v| *v = i);
        }

        // The guard was taken under epoch 0, so after the first flip every
        // later retirement piles up behind it.
        {
            let state = rcu.shared.peek();
            assert!(state.pool.is_empty());
            assert_eq!(state.retired[0].len(), 1);
            assert_eq!(state.retired[1].len(), 4);
        }
        assert_eq!(*guard, 0);
        drop(guard);

        // With the slot cleared the next retirement recycles the backlog.
        rcu.update(|v| *v += 1);
        let state = rcu.shared.peek();
        assert!(state.pool.len() >= 1);
    }

    #[test]
    fn options_are_floor_clamped() {
        let rcu = Rcu::with_options(
            0u8,
            Options {
                flush_threshold: 0,
                cleanup_threshold: 0,
                queue_capacity: 0,
            },
        );
        assert_eq!(rcu.shared.opts.flush_threshold, 1);
        assert_eq!(rcu.shared.opts.cleanup_threshold, 1);
        assert_eq!(rcu.shared.opts.queue_capacity, 1);
        rcu.update(|v| *v = 9);
        assert_eq!(*rcu.reader().read(), 9);
    }
}
