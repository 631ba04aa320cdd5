//! # Mutex
//!
//! The state word is a plain `0` (free) / `1` (held), the number of blocked threads lives next to it in
//! `num_contenders`. Keeping them apart lets a condition variable requeue its waiters onto the state word
//! and still have the unlock path wake them (see [super::condvar]).
//!
//! ## No lost wakeups
//!
//! Blocking is a three-step dance:
//! 1. bump `num_contenders`
//! 2. the futex re-checks that the state word still says "held"
//! 3. sleep
//!
//! and unlocking is the mirror image: store `0` into the state word, then look at `num_contenders`.
//! Both sides use SeqCst, so either the unlocker sees the contender or the contender's futex sees `0`.
//! The contender count drops only after waking up, never before.
//!
//! There's no fairness: a newly arriving thread may take the lock ahead of a woken one.

use std::{
    fmt,
    sync::atomic::{
        AtomicI32, AtomicU32,
        Ordering::{Acquire, Relaxed, SeqCst},
    },
};

use crate::{
    base::{BaseLock, Lockable, DEBUG_LOCKING},
    fatal, fatal_or_warn, futex,
    level::LockLevel,
    thread::{ThreadContext, Tid},
};

pub struct Mutex {
    base: BaseLock,
    /// 0 - free, 1 - held; the futex word
    pub(crate) state: AtomicI32,
    exclusive_owner: AtomicU32,
    /// threads blocked on the state word, condition variable waiters included
    pub(crate) num_contenders: AtomicI32,
    recursive: bool,
    /// only touched by the owner
    pub(crate) recursion_count: AtomicU32,
}

impl Mutex {
    pub fn new(name: &'static str, level: LockLevel) -> Self {
        Self::with_recursion(name, level, false)
    }

    pub fn new_recursive(name: &'static str, level: LockLevel) -> Self {
        Self::with_recursion(name, level, true)
    }

    fn with_recursion(name: &'static str, level: LockLevel, recursive: bool) -> Self {
        Self {
            base: BaseLock::new(name, level),
            state: AtomicI32::new(0),
            exclusive_owner: AtomicU32::new(0),
            num_contenders: AtomicI32::new(0),
            recursive,
            recursion_count: AtomicU32::new(0),
        }
    }

    pub fn base(&self) -> &BaseLock {
        &self.base
    }

    pub fn name(&self) -> &'static str {
        self.base.name()
    }

    pub fn level(&self) -> LockLevel {
        self.base.level()
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    /// Blocks until the lock is ours. A recursive mutex already held by the thread just counts one more level.
    pub fn lock<T: ThreadContext + ?Sized>(&self, thread: &T) {
        if DEBUG_LOCKING && !self.recursive {
            self.assert_not_held(thread);
        }
        if !self.recursive || !self.is_exclusive_held(thread) {
            self.base.check_acquire(thread);
            loop {
                let cur_state = self.state.load(Relaxed);
                if cur_state == 0 {
                    if self
                        .state
                        .compare_exchange_weak(0, 1, Acquire, Relaxed)
                        .is_ok()
                    {
                        break;
                    }
                } else {
                    self.wait_contended(thread, cur_state);
                }
            }
            self.exclusive_owner.store(thread.tid(), Relaxed);
            self.base.register_as_locked(thread);
        }
        let depth = self.recursion_count.fetch_add(1, Relaxed) + 1;
        if DEBUG_LOCKING && depth != 1 && !self.recursive {
            fatal!("Unexpected recursion count on mutex: \"{}\" {depth}", self.name());
        }
    }

    /// Failed to take the lock => hang up until the state word changes. Spurious wakes just retry.
    #[cold]
    fn wait_contended<T: ThreadContext + ?Sized>(&self, thread: &T, cur_state: i32) {
        let _recorder = self
            .base
            .contention()
            .start(thread.tid(), self.exclusive_owner_tid());
        self.num_contenders.fetch_add(1, SeqCst);
        self.base.respond_to_checkpoint(thread);
        if let Err(err) = futex::wait(&self.state, cur_state, None) {
            self.base.futex_failed("wait", err);
        }
        self.num_contenders.fetch_sub(1, SeqCst);
    }

    /// Never blocks, returns whether the lock is ours now.
    /// The level order is only checked once the lock is taken, a failed try orders nothing.
    pub fn try_lock<T: ThreadContext + ?Sized>(&self, thread: &T) -> bool {
        if !self.recursive || !self.is_exclusive_held(thread) {
            loop {
                if self.state.load(Relaxed) != 0 {
                    return false;
                }
                if self
                    .state
                    .compare_exchange_weak(0, 1, Acquire, Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
            self.base.check_acquire(thread);
            self.exclusive_owner.store(thread.tid(), Relaxed);
            self.base.register_as_locked(thread);
        }
        let depth = self.recursion_count.fetch_add(1, Relaxed) + 1;
        if DEBUG_LOCKING && depth != 1 && !self.recursive {
            fatal!("Unexpected recursion count on mutex: \"{}\" {depth}", self.name());
        }
        true
    }

    /// Drops one level of recursion, the last one releases the lock and wakes a single contender
    pub fn unlock<T: ThreadContext + ?Sized>(&self, thread: &T) {
        self.base.assert_current(thread);
        if !self.is_exclusive_held(thread) {
            fatal!(
                "Unlocking \"{}\" by thread {} while the owner is {}",
                self.name(),
                thread.tid(),
                self.exclusive_owner_tid()
            );
        }
        let depth = self.recursion_count.fetch_sub(1, Relaxed) - 1;
        if self.recursive && depth > 0 {
            return;
        }
        self.base.register_as_unlocked(thread);
        loop {
            let cur_state = self.state.load(Relaxed);
            if cur_state != 1 {
                fatal!("Unexpected state {cur_state} in unlock for \"{}\"", self.name());
            }
            // we're no longer the owner
            self.exclusive_owner.store(0, Relaxed);
            // SeqCst: the load of num_contenders below must not move before the release of the state word
            if self
                .state
                .compare_exchange_weak(1, 0, SeqCst, Relaxed)
                .is_ok()
            {
                if self.num_contenders.load(SeqCst) > 0 {
                    if let Err(err) = futex::wake(&self.state, 1) {
                        self.base.futex_failed("wake", err);
                    }
                }
                return;
            }
        }
    }

    pub fn is_exclusive_held<T: ThreadContext + ?Sized>(&self, thread: &T) -> bool {
        let held = self.exclusive_owner.load(Relaxed) == thread.tid();
        if DEBUG_LOCKING
            && held
            && self.level() != LockLevel::Monitor
            && !std::thread::panicking()
            && thread.held_lock(self.level()) != Some(self.base.handle())
        {
            fatal!("\"{}\" is owned by {} but missing from its held locks", self.name(), thread.tid());
        }
        held
    }

    /// 0 when free
    pub fn exclusive_owner_tid(&self) -> Tid {
        self.exclusive_owner.load(Relaxed)
    }

    /// recursion depth of the current owner, 0 when free
    pub fn depth(&self) -> u32 {
        self.recursion_count.load(Relaxed)
    }

    pub fn num_contenders(&self) -> i32 {
        self.num_contenders.load(Relaxed)
    }

    pub fn assert_held<T: ThreadContext + ?Sized>(&self, thread: &T) {
        if DEBUG_LOCKING && !self.is_exclusive_held(thread) {
            fatal!("\"{}\" isn't held by thread {}", self.name(), thread.tid());
        }
    }

    pub fn assert_exclusive_held<T: ThreadContext + ?Sized>(&self, thread: &T) {
        self.assert_held(thread)
    }

    pub fn assert_not_held<T: ThreadContext + ?Sized>(&self, thread: &T) {
        if DEBUG_LOCKING && self.is_exclusive_held(thread) {
            fatal!("\"{}\" is unexpectedly held by thread {}", self.name(), thread.tid());
        }
    }

    /// Wakes every blocked thread without touching the lock, so they re-run their checkpoint check and block again
    pub fn wake_all_for_checkpoint(&self) {
        if DEBUG_LOCKING && !self.base.should_respond_to_checkpoint() {
            fatal!("\"{}\" doesn't respond to empty checkpoints", self.name());
        }
        self.wake_waiters();
    }

    fn wake_waiters(&self) {
        if self.num_contenders.load(Relaxed) > 0 {
            if let Err(err) = futex::wake_all(&self.state) {
                self.base.futex_failed("wake", err);
            }
        }
    }
}

impl Lockable for Mutex {
    fn base(&self) -> &BaseLock {
        &self.base
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(
            out,
            "{} {} level={} rec={} owner={} ",
            if self.recursive { "recursive" } else { "non-recursive" },
            self.name(),
            self.level(),
            self.depth(),
            self.exclusive_owner_tid()
        )?;
        self.base.contention().dump(out)
    }

    /// No flag check: the lock may have just left the weak reference list, an extra wake is harmless
    fn wakeup_to_respond_to_checkpoint(&self) {
        self.wake_waiters()
    }
}

impl fmt::Display for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dump(f)
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dump(f)
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        let state = *self.state.get_mut();
        let owner = *self.exclusive_owner.get_mut();
        if state != 0 {
            fatal_or_warn!("destroying mutex \"{}\" with owner: {owner}", self.name());
        } else {
            if owner != 0 {
                fatal_or_warn!("unexpectedly found an owner on unlocked mutex \"{}\"", self.name());
            }
            if *self.num_contenders.get_mut() != 0 {
                fatal_or_warn!("unexpectedly found a contender on mutex \"{}\"", self.name());
            }
        }
    }
}

/// Holds the mutex for its lifetime
pub struct MutexLock<'a, T: ThreadContext + ?Sized> {
    mutex: &'a Mutex,
    thread: &'a T,
}

impl<'a, T: ThreadContext + ?Sized> MutexLock<'a, T> {
    pub fn new(thread: &'a T, mutex: &'a Mutex) -> Self {
        mutex.lock(thread);
        Self { mutex, thread }
    }
}

impl<T: ThreadContext + ?Sized> Drop for MutexLock<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock(self.thread);
    }
}

#[cfg(test)]
mod test {
    use std::{
        cell::UnsafeCell,
        sync::{
            atomic::{AtomicBool, AtomicUsize},
            Arc,
        },
        thread::{scope, sleep},
        time::Duration,
    };

    use rand::Rng;

    use super::*;
    use crate::{checkpoint::CheckpointSlot, sync::Barrier, thread::LockThread};

    /// a counter only the mutex protects, so torn updates would show up as a wrong total
    struct Guarded {
        value: UnsafeCell<u64>,
    }
    unsafe impl Sync for Guarded {}

    #[test]
    fn lock_unlock_single_thread() {
        let mutex = Mutex::new("single", LockLevel::DefaultMutexLevel);
        let thread = LockThread::attach();
        mutex.lock(&thread);
        assert!(mutex.is_exclusive_held(&thread));
        assert_eq!(mutex.depth(), 1);
        assert_eq!(mutex.exclusive_owner_tid(), thread.tid());
        mutex.unlock(&thread);
        assert!(!mutex.is_exclusive_held(&thread));
        assert_eq!(mutex.exclusive_owner_tid(), 0);
        assert_eq!(thread.number_of_held_locks(), 0);
    }

    #[test]
    fn mutual_exclusion_under_stress() {
        let mutex = Mutex::new("stress", LockLevel::DefaultMutexLevel);
        let counter = Guarded { value: UnsafeCell::new(0) };
        let inside = AtomicBool::new(false);
        let mut rng = rand::rng();
        let threads = rng.random_range(2..8);
        let iterations = rng.random_range(1_000..5_000);

        scope(|s| {
            for _ in 0..threads {
                s.spawn(|| {
                    // capture the whole Sync wrapper, not just the UnsafeCell field
                    let _ = &counter;
                    let thread = LockThread::attach();
                    for _ in 0..iterations {
                        let _mu = MutexLock::new(&thread, &mutex);
                        // nobody else may be in here
                        assert!(!inside.swap(true, Relaxed));
                        // SAFETY: protected by the mutex
                        unsafe { *counter.value.get() += 1 };
                        inside.store(false, Relaxed);
                    }
                });
            }
        });

        assert_eq!(unsafe { *counter.value.get() }, threads * iterations);
        assert_eq!(mutex.num_contenders(), 0);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let mutex = Mutex::new("try", LockLevel::DefaultMutexLevel);
        let owner = LockThread::attach();
        mutex.lock(&owner);
        scope(|s| {
            s.spawn(|| {
                let other = LockThread::attach();
                assert!(!mutex.try_lock(&other));
                assert_eq!(other.number_of_held_locks(), 0);
            });
        });
        mutex.unlock(&owner);
        assert!(mutex.try_lock(&owner));
        mutex.unlock(&owner);
    }

    #[test]
    fn recursive_needs_as_many_unlocks() {
        let mutex = Mutex::new_recursive("recursive", LockLevel::DefaultMutexLevel);
        let owner = LockThread::attach();
        for _ in 0..3 {
            mutex.lock(&owner);
        }
        assert!(mutex.try_lock(&owner));
        assert_eq!(mutex.depth(), 4);

        let acquired = AtomicBool::new(false);
        scope(|s| {
            s.spawn(|| {
                let other = LockThread::attach();
                mutex.lock(&other);
                acquired.store(true, SeqCst);
                mutex.unlock(&other);
            });
            for _ in 0..4 {
                sleep(Duration::from_millis(10));
                // still ours until the last unlock
                assert!(!acquired.load(SeqCst));
                mutex.unlock(&owner);
            }
        });
        assert!(acquired.load(SeqCst));
    }

    #[test]
    fn blocked_thread_wakes_after_unlock() {
        let mutex = Mutex::new("wakeup", LockLevel::DefaultMutexLevel);
        let owner = LockThread::attach();
        mutex.lock(&owner);
        let done = AtomicBool::new(false);
        scope(|s| {
            s.spawn(|| {
                let other = LockThread::attach();
                mutex.lock(&other);
                done.store(true, SeqCst);
                mutex.unlock(&other);
            });
            // wait for the contender to block
            while mutex.num_contenders() == 0 {
                std::thread::yield_now();
            }
            mutex.unlock(&owner);
        });
        assert!(done.load(SeqCst));
    }

    #[test]
    fn no_lost_wakeups_with_random_counts() {
        let mut rng = rand::rng();
        for _ in 0..5 {
            let mutex = Arc::new(Mutex::new("lost wakeup", LockLevel::DefaultMutexLevel));
            let total = Arc::new(AtomicUsize::new(0));
            let threads = rng.random_range(2..6);
            let iterations = rng.random_range(100..2_000);
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let mutex = Arc::clone(&mutex);
                    let total = Arc::clone(&total);
                    std::thread::spawn(move || {
                        let thread = LockThread::attach();
                        for _ in 0..iterations {
                            mutex.lock(&thread);
                            total.fetch_add(1, Relaxed);
                            mutex.unlock(&thread);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(total.load(Relaxed), threads * iterations);
        }
    }

    #[test]
    fn dump_shows_owner_and_depth() {
        let mutex = Mutex::new_recursive("dumped mutex", LockLevel::Trace);
        let thread = LockThread::attach();
        mutex.lock(&thread);
        mutex.lock(&thread);
        let text = mutex.to_string();
        assert!(
            text.starts_with(&format!("recursive dumped mutex level=Trace rec=2 owner={} ", thread.tid())),
            "{text}"
        );
        mutex.unlock(&thread);
        mutex.unlock(&thread);
        assert!(mutex.to_string().contains("rec=0 owner=0"));
    }

    #[test]
    #[cfg(feature = "contention-log")]
    fn contention_gets_recorded() {
        let mutex = Mutex::new("contended mutex", LockLevel::DefaultMutexLevel);
        let owner = LockThread::attach();
        mutex.lock(&owner);
        scope(|s| {
            s.spawn(|| {
                let other = LockThread::attach();
                mutex.lock(&other);
                mutex.unlock(&other);
            });
            while mutex.num_contenders() == 0 {
                std::thread::yield_now();
            }
            sleep(Duration::from_millis(5));
            mutex.unlock(&owner);
        });
        assert!(mutex.has_ever_contended());
        assert!(mutex.to_string().contains("owning during this time"));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "is unexpectedly held")]
    fn non_recursive_reentry_is_fatal() {
        let mutex = Mutex::new("reentered", LockLevel::DefaultMutexLevel);
        let thread = LockThread::attach();
        mutex.lock(&thread);
        mutex.lock(&thread);
    }

    #[test]
    #[should_panic(expected = "while the owner is")]
    fn unlock_by_non_owner_is_fatal() {
        let mutex = Mutex::new("foreign unlock", LockLevel::DefaultMutexLevel);
        mutex.unlock(&LockThread::attach());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock level violation")]
    fn acquiring_upwards_is_rejected() {
        let higher = Mutex::new("A", LockLevel::ThreadList);
        let lower = Mutex::new("B", LockLevel::InternTable);
        let thread = LockThread::attach();
        lower.lock(&thread);
        higher.lock(&thread);
    }

    #[test]
    fn acquiring_downwards_is_fine() {
        let higher = Mutex::new("A", LockLevel::ThreadList);
        let lower = Mutex::new("B", LockLevel::InternTable);
        let thread = LockThread::attach();
        higher.lock(&thread);
        lower.lock(&thread);
        assert_eq!(thread.number_of_held_locks(), 2);
        lower.unlock(&thread);
        higher.unlock(&thread);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "doesn't respond to empty checkpoints")]
    fn checkpoint_wakeup_needs_the_flag() {
        Mutex::new("unflagged", LockLevel::DefaultMutexLevel).wake_all_for_checkpoint();
    }

    #[test]
    fn blocked_contender_answers_a_checkpoint() {
        let mutex = Mutex::new("flagged", LockLevel::DefaultMutexLevel);
        mutex.base().set_should_respond_to_checkpoint(true);
        let owner = LockThread::attach();
        mutex.lock(&owner);
        let slot = Arc::new(CheckpointSlot::new());
        let barrier = Arc::new(Barrier::new(0));
        let acquired = AtomicBool::new(false);
        scope(|s| {
            s.spawn(|| {
                let other = LockThread::attach_with_checkpoint(Arc::clone(&slot));
                mutex.lock(&other);
                acquired.store(true, SeqCst);
                mutex.unlock(&other);
            });
            while mutex.num_contenders() == 0 {
                std::thread::yield_now();
            }
            assert!(slot.request(&barrier));
            // the request may land right after the contender's check, keep waking until it passes
            while barrier.count() != -1 {
                mutex.wake_all_for_checkpoint();
                sleep(Duration::from_millis(1));
            }
            assert!(!slot.is_pending());
            // it passed without getting the lock
            assert!(mutex.is_exclusive_held(&owner));
            assert!(!acquired.load(SeqCst));
            mutex.unlock(&owner);
        });
        assert!(acquired.load(SeqCst));
        barrier.init(&owner, 0);
    }

    #[test]
    fn registry_wakeup_of_an_unflagged_lock_is_harmless() {
        let lock = Mutex::new("left the weak reference list", LockLevel::DefaultMutexLevel);
        lock.base().set_should_respond_to_checkpoint(true);
        lock.base().set_should_respond_to_checkpoint(false);
        Lockable::wakeup_to_respond_to_checkpoint(&lock);
    }

    #[test]
    fn failed_try_lock_orders_nothing() {
        let high = Mutex::new("try high", LockLevel::Trace);
        let low = Mutex::new("try low", LockLevel::ThreadList);
        let thread = LockThread::attach();
        high.lock(&thread);
        low.lock(&thread);
        // upwards, but it can't succeed anyway
        assert!(!high.try_lock(&thread));
        low.unlock(&thread);
        high.unlock(&thread);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock level violation")]
    fn successful_try_lock_upwards_is_fatal() {
        let high = Mutex::new("try high taken", LockLevel::Trace);
        let low = Mutex::new("try low held", LockLevel::ThreadList);
        let thread = LockThread::attach();
        low.lock(&thread);
        let _ = high.try_lock(&thread);
    }
}
