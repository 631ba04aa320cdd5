//! # Condition variable
//!
//! Bound to exactly one [Mutex], the guard, for its whole life.
//! Like any condvar it unlocks the guard, waits for a signal, then locks the guard back.
//!
//! The futex word is `sequence`, bumped on every signal and broadcast. A waiter remembers the value it saw
//! before unlocking the guard and only sleeps while the word still holds it, so a signal sent between the
//! unlock and the futex call isn't missed. A wakeup that didn't come with a new sequence (EINTR, a stray
//! wake) just goes back to sleep.
//!
//! ## Broadcast without the herd
//!
//! Waking N waiters at once makes all of them rush for the guard that only one of them can get.
//! Instead broadcast requeues every waiter from `sequence` onto the guard's own state word. They then get
//! woken one by one by the guard's regular unlock.
//!
//! For that to work the guard's unlock has to know somebody's there, so every waiter counts itself as a
//! contender of the guard for the whole wait.
//!
//! ## Recursion
//!
//! A recursive guard may be held several levels deep when waiting. The depth is saved, the guard is
//! released completely, and the depth is restored once it's locked again.

use std::{
    fmt,
    ops::Deref,
    sync::atomic::{
        AtomicI32,
        Ordering::{Relaxed, SeqCst},
    },
    time::{Duration, Instant},
};

use crate::{
    fatal_or_warn, futex,
    futex::WaitResult,
    sync::mutex::Mutex,
    thread::ThreadContext,
};

/// `M` is whatever keeps the guard alive: a plain reference for the registry's locks, an `Arc` for
/// objects that own both.
pub struct ConditionVariable<M: Deref<Target = Mutex> = &'static Mutex> {
    name: &'static str,
    guard: M,
    sequence: AtomicI32,
    /// only changed with the guard held
    num_waiters: AtomicI32,
}

impl<M: Deref<Target = Mutex>> ConditionVariable<M> {
    pub fn new(name: &'static str, guard: M) -> Self {
        Self {
            name,
            guard,
            sequence: AtomicI32::new(0),
            num_waiters: AtomicI32::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn guard(&self) -> &Mutex {
        &self.guard
    }

    pub fn num_waiters(&self) -> i32 {
        self.num_waiters.load(Relaxed)
    }

    /// Waits for a signal. The thread must hold the guard and, with debug locking, nothing else.
    pub fn wait<T: ThreadContext + ?Sized>(&self, thread: &T) {
        self.guard.base().check_safe_to_wait(thread);
        self.wait_holding_locks(thread);
    }

    /// Same as [Self::wait] but other locks may be held, the caller vouches they don't deadlock with the signaler
    pub fn wait_holding_locks<T: ThreadContext + ?Sized>(&self, thread: &T) {
        let (cur_sequence, depth) = self.prepare_wait(thread);
        loop {
            if let Err(err) = futex::wait(&self.sequence, cur_sequence, None) {
                self.guard.base().futex_failed("wait", err);
            }
            if self.sequence.load(Relaxed) != cur_sequence {
                break;
            }
        }
        self.finish_wait(thread, depth);
    }

    /// Waits for a signal at most `timeout`. Returns whether it timed out without a signal.
    /// The guard is held again on return either way.
    pub fn timed_wait<T: ThreadContext + ?Sized>(&self, thread: &T, timeout: Duration) -> bool {
        self.guard.base().check_safe_to_wait(thread);
        let deadline = Instant::now() + timeout;
        let (cur_sequence, depth) = self.prepare_wait(thread);
        let timed_out = loop {
            let now = Instant::now();
            if now >= deadline {
                break self.sequence.load(Relaxed) == cur_sequence;
            }
            match futex::wait(&self.sequence, cur_sequence, Some(deadline - now)) {
                // a signal may have raced the timeout, it wins
                Ok(WaitResult::TimedOut) => break self.sequence.load(Relaxed) == cur_sequence,
                Ok(_) => {}
                Err(err) => self.guard.base().futex_failed("wait", err),
            }
            if self.sequence.load(Relaxed) != cur_sequence {
                break false;
            }
        };
        self.finish_wait(thread, depth);
        timed_out
    }

    /// Releases the guard completely, returns the sequence to wait on and the guard's recursion depth
    fn prepare_wait<T: ThreadContext + ?Sized>(&self, thread: &T) -> (i32, u32) {
        let guard = &*self.guard;
        guard.assert_exclusive_held(thread);
        self.num_waiters.fetch_add(1, SeqCst);
        // the guard's unlock has to wake us after a requeue
        guard.num_contenders.fetch_add(1, SeqCst);
        let cur_sequence = self.sequence.load(Relaxed);
        // one unlock must be enough, the real depth comes back in finish_wait
        let depth = guard.recursion_count.swap(1, Relaxed);
        guard.unlock(thread);
        (cur_sequence, depth)
    }

    fn finish_wait<T: ThreadContext + ?Sized>(&self, thread: &T, depth: u32) {
        let guard = &*self.guard;
        guard.lock(thread);
        guard.recursion_count.store(depth, Relaxed);
        self.num_waiters.fetch_sub(1, SeqCst);
        guard.num_contenders.fetch_sub(1, SeqCst);
    }

    /// Wakes one waiter, if there's any. The thread must hold the guard.
    pub fn signal<T: ThreadContext + ?Sized>(&self, thread: &T) {
        self.guard.assert_exclusive_held(thread);
        if self.num_waiters.load(Relaxed) > 0 {
            self.sequence.fetch_add(1, SeqCst);
            if let Err(err) = futex::wake(&self.sequence, 1) {
                self.guard.base().futex_failed("wake", err);
            }
        }
    }

    /// Moves every waiter onto the guard's queue, the guard's unlocks wake them one at a time.
    /// The thread must hold the guard.
    pub fn broadcast<T: ThreadContext + ?Sized>(&self, thread: &T) {
        self.guard.assert_exclusive_held(thread);
        if self.num_waiters.load(Relaxed) == 0 {
            return;
        }
        self.sequence.fetch_add(1, SeqCst);
        loop {
            let cur_sequence = self.sequence.load(Relaxed);
            match futex::cmp_requeue(&self.sequence, cur_sequence, &self.guard.state, 0, i32::MAX) {
                Ok(true) => return,
                // the sequence moved or a signal hit us, try again with the new value
                Ok(false) => {}
                Err(err) => self.guard.base().futex_failed("cmp requeue", err),
            }
        }
    }
}

impl<M: Deref<Target = Mutex>> fmt::Debug for ConditionVariable<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("name", &self.name)
            .field("guard", &self.guard.name())
            .field("sequence", &self.sequence.load(Relaxed))
            .field("num_waiters", &self.num_waiters.load(Relaxed))
            .finish()
    }
}

impl<M: Deref<Target = Mutex>> Drop for ConditionVariable<M> {
    fn drop(&mut self) {
        let num_waiters = *self.num_waiters.get_mut();
        if num_waiters != 0 {
            fatal_or_warn!(
                "destroying condition variable \"{}\" with {num_waiters} waiters on \"{}\"",
                self.name,
                self.guard.name()
            );
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize},
            Arc,
        },
        thread::scope,
    };

    use rand::Rng;

    use super::*;
    use crate::{level::LockLevel, sync::mutex::MutexLock, thread::LockThread};

    #[test]
    fn signal_wakes_a_waiter() {
        let mutex = Mutex::new("signal guard", LockLevel::DefaultMutexLevel);
        let cond = ConditionVariable::new("signal cond", &mutex);
        let ready = AtomicBool::new(false);
        let mut wakeups = 0;
        scope(|s| {
            s.spawn(|| {
                let thread = LockThread::attach();
                // signal only once the main thread sleeps, so it doesn't skip the wait altogether
                loop {
                    let _mu = MutexLock::new(&thread, &mutex);
                    if cond.num_waiters() == 1 {
                        ready.store(true, Relaxed);
                        cond.signal(&thread);
                        break;
                    }
                }
            });

            let thread = LockThread::attach();
            let _mu = MutexLock::new(&thread, &mutex);
            while !ready.load(Relaxed) {
                cond.wait(&thread);
                wakeups += 1;
            }
            assert!(mutex.is_exclusive_held(&thread));
        });
        // one wakeup, a signal never returns twice
        assert_eq!(wakeups, 1);
        assert_eq!(cond.num_waiters(), 0);
        assert_eq!(mutex.num_contenders(), 0);
    }

    #[test]
    fn broadcast_releases_every_waiter_exactly_once() {
        let mut rng = rand::rng();
        for _ in 0..5 {
            let waiters = rng.random_range(2..8);
            let mutex = Mutex::new("broadcast guard", LockLevel::DefaultMutexLevel);
            let cond = ConditionVariable::new("broadcast cond", &mutex);
            let released = AtomicBool::new(false);
            let observed = AtomicUsize::new(0);
            scope(|s| {
                for _ in 0..waiters {
                    s.spawn(|| {
                        let thread = LockThread::attach();
                        let _mu = MutexLock::new(&thread, &mutex);
                        while !released.load(Relaxed) {
                            cond.wait(&thread);
                        }
                        observed.fetch_add(1, Relaxed);
                    });
                }
                let thread = LockThread::attach();
                // broadcast only once everybody's asleep to actually exercise the requeue
                loop {
                    let _mu = MutexLock::new(&thread, &mutex);
                    if cond.num_waiters() == waiters {
                        released.store(true, Relaxed);
                        cond.broadcast(&thread);
                        break;
                    }
                }
            });
            assert_eq!(observed.load(Relaxed), waiters as usize);
            assert_eq!(cond.num_waiters(), 0);
            assert_eq!(mutex.num_contenders(), 0);
        }
    }

    #[test]
    fn broadcast_without_waiters_is_a_no_op() {
        let mutex = Mutex::new("idle guard", LockLevel::DefaultMutexLevel);
        let cond = ConditionVariable::new("idle cond", &mutex);
        let thread = LockThread::attach();
        let _mu = MutexLock::new(&thread, &mutex);
        cond.broadcast(&thread);
        cond.signal(&thread);
        assert_eq!(cond.sequence.load(Relaxed), 0);
    }

    #[test]
    fn timed_wait_times_out_holding_the_guard() {
        let mutex = Mutex::new("timed guard", LockLevel::DefaultMutexLevel);
        let cond = ConditionVariable::new("timed cond", &mutex);
        let thread = LockThread::attach();
        let _mu = MutexLock::new(&thread, &mutex);
        let start = Instant::now();
        assert!(cond.timed_wait(&thread, Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(mutex.is_exclusive_held(&thread));
        assert_eq!(cond.num_waiters(), 0);
    }

    #[test]
    fn timed_wait_returns_early_on_signal() {
        let mutex = Arc::new(Mutex::new("arc guard", LockLevel::DefaultMutexLevel));
        let cond = ConditionVariable::new("arc cond", Arc::clone(&mutex));
        scope(|s| {
            let thread = LockThread::attach();
            let _mu = MutexLock::new(&thread, &mutex);
            s.spawn(|| {
                let signaler = LockThread::attach();
                // the waiter released the guard => it's inside the wait
                let _mu = MutexLock::new(&signaler, &mutex);
                cond.signal(&signaler);
            });
            assert!(!cond.timed_wait(&thread, Duration::from_secs(10)));
        });
    }

    #[test]
    fn recursive_guard_gets_its_depth_back() {
        let mutex = Mutex::new_recursive("recursive guard", LockLevel::DefaultMutexLevel);
        let cond = ConditionVariable::new("recursive cond", &mutex);
        let thread = LockThread::attach();
        mutex.lock(&thread);
        mutex.lock(&thread);
        mutex.lock(&thread);
        scope(|s| {
            s.spawn(|| {
                let other = LockThread::attach();
                // only gets in if the wait released all three levels
                let _mu = MutexLock::new(&other, &mutex);
                assert_eq!(mutex.depth(), 1);
                cond.signal(&other);
            });
            assert!(!cond.timed_wait(&thread, Duration::from_secs(10)));
        });
        assert_eq!(mutex.depth(), 3);
        for _ in 0..3 {
            mutex.unlock(&thread);
        }
        assert_eq!(mutex.depth(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "isn't held")]
    fn signal_without_the_guard() {
        let mutex = Mutex::new("unheld guard", LockLevel::DefaultMutexLevel);
        let cond = ConditionVariable::new("unheld cond", &mutex);
        cond.signal(&LockThread::attach());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "unsafe wait")]
    fn waiting_with_another_lock_held() {
        let outer = Mutex::new("outer", LockLevel::ThreadList);
        let mutex = Mutex::new("inner guard", LockLevel::DefaultMutexLevel);
        let cond = ConditionVariable::new("inner cond", &mutex);
        let thread = LockThread::attach();
        outer.lock(&thread);
        mutex.lock(&thread);
        cond.wait(&thread);
    }
}
