//! # Barrier
//!
//! A counter threads pass and wait on. Passing decrements it, waiting adds to it and blocks until it's 0
//! again. That's what an empty checkpoint needs: the requester doesn't know how many threads will pass
//! before it starts waiting, so the count may go negative for a while.

use std::{
    sync::{
        atomic::{AtomicI32, Ordering::Relaxed},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{
    level::LockLevel,
    sync::{
        condvar::ConditionVariable,
        mutex::{Mutex, MutexLock},
    },
    thread::ThreadContext,
};

pub struct Barrier {
    /// only changed with the lock held
    count: AtomicI32,
    condition: ConditionVariable<Arc<Mutex>>,
}

impl Barrier {
    pub fn new(count: i32) -> Self {
        let lock = Arc::new(Mutex::new("GC barrier lock", LockLevel::ThreadSuspendCount));
        Self {
            count: AtomicI32::new(count),
            condition: ConditionVariable::new("GC barrier condition", lock),
        }
    }

    fn lock(&self) -> &Mutex {
        self.condition.guard()
    }

    /// Resets the count, releasing the waiters if it's 0
    pub fn init<T: ThreadContext + ?Sized>(&self, thread: &T, count: i32) {
        let _mu = MutexLock::new(thread, self.lock());
        self.set_count_locked(thread, count);
    }

    pub fn pass<T: ThreadContext + ?Sized>(&self, thread: &T) {
        let _mu = MutexLock::new(thread, self.lock());
        self.set_count_locked(thread, self.count.load(Relaxed) - 1);
    }

    /// Passes and waits for everybody else to pass too
    pub fn wait<T: ThreadContext + ?Sized>(&self, thread: &T) {
        self.increment(thread, -1);
    }

    /// Adds `delta` and waits until the count drops to 0
    pub fn increment<T: ThreadContext + ?Sized>(&self, thread: &T, delta: i32) {
        let _mu = MutexLock::new(thread, self.lock());
        self.set_count_locked(thread, self.count.load(Relaxed) + delta);
        while self.count.load(Relaxed) != 0 {
            self.condition.wait(thread);
        }
    }

    /// Same as [Self::increment] but gives up after `timeout`, returns whether it did
    pub fn increment_timed<T: ThreadContext + ?Sized>(&self, thread: &T, delta: i32, timeout: Duration) -> bool {
        let _mu = MutexLock::new(thread, self.lock());
        self.set_count_locked(thread, self.count.load(Relaxed) + delta);
        let deadline = Instant::now() + timeout;
        while self.count.load(Relaxed) != 0 {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            if self.condition.timed_wait(thread, deadline - now) && self.count.load(Relaxed) != 0 {
                return true;
            }
        }
        false
    }

    /// racy unless the caller holds the lock, good enough for diagnostics
    pub fn count(&self) -> i32 {
        self.count.load(Relaxed)
    }

    fn set_count_locked<T: ThreadContext + ?Sized>(&self, thread: &T, count: i32) {
        self.count.store(count, Relaxed);
        if count == 0 {
            self.condition.broadcast(thread);
        }
    }
}

impl Drop for Barrier {
    fn drop(&mut self) {
        let count = *self.count.get_mut();
        if count != 0 {
            log::warn!("Attempted to destroy barrier with non zero count {count}");
        }
    }
}

#[cfg(test)]
mod test {
    use std::thread::scope;

    use rand::Rng;

    use super::*;
    use crate::thread::LockThread;

    #[test]
    fn waiter_released_by_the_last_pass() {
        let passers = rand::rng().random_range(1..8);
        let barrier = Barrier::new(0);
        scope(|s| {
            for _ in 0..passers {
                s.spawn(|| barrier.pass(&LockThread::attach()));
            }
            // the passes may land before or after this, the count sorts it out
            barrier.increment(&LockThread::attach(), passers);
        });
        assert_eq!(barrier.count(), 0);
    }

    #[test]
    fn everybody_waits_for_everybody() {
        let threads = 4;
        let barrier = Barrier::new(threads);
        scope(|s| {
            for _ in 0..threads {
                s.spawn(|| barrier.wait(&LockThread::attach()));
            }
        });
        assert_eq!(barrier.count(), 0);
    }

    #[test]
    fn timed_increment_times_out_without_passes() {
        let barrier = Barrier::new(0);
        let thread = LockThread::attach();
        let start = Instant::now();
        assert!(barrier.increment_timed(&thread, 2, Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(barrier.count(), 2);

        // the missing passes arrive, a follow-up increment of 0 succeeds
        barrier.pass(&thread);
        barrier.pass(&thread);
        assert!(!barrier.increment_timed(&thread, 0, Duration::from_millis(20)));
    }

    #[test]
    fn init_to_zero_releases_waiters() {
        let barrier = Barrier::new(0);
        scope(|s| {
            s.spawn(|| barrier.increment(&LockThread::attach(), 1));
            let thread = LockThread::attach();
            while barrier.condition.num_waiters() == 0 {
                std::thread::yield_now();
            }
            barrier.init(&thread, 0);
        });
    }
}
