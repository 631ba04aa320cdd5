//! # Empty checkpoints
//!
//! Sometimes a thread needs every other thread to "check in" once, e.g. to make sure nobody is still in
//! the middle of a weak reference access. That's an empty checkpoint: each runnable thread passes a
//! [Barrier] at its next opportunity and the requester waits on it.
//!
//! A thread checks for a pending request at its own safepoints and, what matters here, right before
//! blocking on a lock that responds to checkpoints. Such locks get woken periodically by the requester so
//! their blocked threads get the chance.
//!
//! Suspended threads can't be touching anything, so they're skipped; a thread suspending with a request
//! pending runs it first.
//!
//! Several requesters may overlap. Each gets its own barrier and a runnable thread passes all of them.
//! Only a suspended thread ever turns a request down.

use std::sync::{
    atomic::{
        AtomicBool,
        Ordering::{Acquire, Relaxed, Release},
    },
    Arc,
};

use crate::{spin::SpinLock, sync::Barrier, thread::ThreadContext};

struct SlotState {
    runnable: bool,
    /// one per requester, passed in request order
    barriers: Vec<Arc<Barrier>>,
}

/// Where a thread receives checkpoint requests. Shared between the thread and whoever requests.
pub struct CheckpointSlot {
    /// fast path check, the state decides
    pending: AtomicBool,
    state: SpinLock<SlotState>,
}

impl CheckpointSlot {
    pub fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            state: SpinLock::new(SlotState {
                runnable: true,
                barriers: Vec::new(),
            }),
        }
    }

    /// Asks the thread to pass `barrier`. Fails only for suspended threads.
    pub fn request(&self, barrier: &Arc<Barrier>) -> bool {
        let mut state = self.state.lock();
        if !state.runnable {
            return false;
        }
        state.barriers.push(Arc::clone(barrier));
        self.pending.store(true, Release);
        true
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Acquire)
    }

    pub fn is_runnable(&self) -> bool {
        self.state.lock().runnable
    }

    /// Passes every pending barrier. Only the thread owning the slot calls this.
    pub fn run_if_pending<T: ThreadContext + ?Sized>(&self, thread: &T) {
        if !self.is_pending() {
            return;
        }
        // pass outside of the spin lock, passing takes the barrier's mutex
        for barrier in self.take() {
            barrier.pass(thread);
        }
    }

    /// The thread stops touching shared state: runs what's pending and won't get new requests
    pub fn suspend<T: ThreadContext + ?Sized>(&self, thread: &T) {
        let barriers = {
            let mut state = self.state.lock();
            state.runnable = false;
            self.pending.store(false, Relaxed);
            std::mem::take(&mut state.barriers)
        };
        for barrier in barriers {
            barrier.pass(thread);
        }
    }

    pub fn resume(&self) {
        self.state.lock().runnable = true;
    }

    fn take(&self) -> Vec<Arc<Barrier>> {
        let mut state = self.state.lock();
        self.pending.store(false, Relaxed);
        std::mem::take(&mut state.barriers)
    }
}

impl Default for CheckpointSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::thread::LockThread;

    #[test]
    fn request_then_run() {
        let thread = LockThread::attach();
        let slot = thread.checkpoint_slot();
        let barrier = Arc::new(Barrier::new(0));

        assert!(slot.request(&barrier));
        assert!(slot.is_pending());

        slot.run_if_pending(&thread);
        assert!(!slot.is_pending());
        assert_eq!(barrier.count(), -1);
        assert!(!barrier.increment_timed(&thread, 1, Duration::from_millis(10)));
    }

    #[test]
    fn suspended_threads_are_skipped() {
        let thread = LockThread::attach();
        let slot = thread.checkpoint_slot();
        let barrier = Arc::new(Barrier::new(0));
        slot.suspend(&thread);
        assert!(!slot.is_runnable());
        assert!(!slot.request(&barrier));
        slot.resume();
        assert!(slot.request(&barrier));
        slot.run_if_pending(&thread);
        barrier.init(&thread, 0);
    }

    #[test]
    fn suspending_runs_the_pending_request() {
        let thread = LockThread::attach();
        let slot = thread.checkpoint_slot();
        let barrier = Arc::new(Barrier::new(1));
        assert!(slot.request(&barrier));
        slot.suspend(&thread);
        assert_eq!(barrier.count(), 0);
        assert!(!slot.is_pending());
    }

    #[test]
    fn overlapping_requests_are_all_passed() {
        let thread = LockThread::attach();
        let slot = thread.checkpoint_slot();
        let first = Arc::new(Barrier::new(0));
        let second = Arc::new(Barrier::new(0));

        assert!(slot.request(&first));
        // a second requester isn't turned away while the first one waits
        assert!(slot.request(&second));

        slot.run_if_pending(&thread);
        assert!(!slot.is_pending());
        assert_eq!(first.count(), -1);
        assert_eq!(second.count(), -1);
        first.init(&thread, 0);
        second.init(&thread, 0);
    }

    #[test]
    fn suspending_passes_every_pending_request() {
        let thread = LockThread::attach();
        let slot = thread.checkpoint_slot();
        let first = Arc::new(Barrier::new(1));
        let second = Arc::new(Barrier::new(1));
        assert!(slot.request(&first));
        assert!(slot.request(&second));
        slot.suspend(&thread);
        assert_eq!(first.count(), 0);
        assert_eq!(second.count(), 0);
    }
}
