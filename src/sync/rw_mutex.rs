//! # Reader-writer mutex
//!
//! One signed state word tracks everything:
//! - `-1` - held exclusively, `exclusive_owner` says by whom
//! - `0` - free
//! - `N > 0` - held by N readers
//!
//! Readers and writers park on the same word, so the writer's unlock has to wake all of them: there's no
//! way to wake "just a writer" or "just the readers".
//!
//! ## Readers never wake anybody
//!
//! [ReaderWriterMutex::unlock_shared] only decrements the word. Going from N to N-1 readers doesn't free
//! the lock, and issuing a wake on every read unlock would mostly be wasted syscalls.
//! Instead a writer that finds readers inside waits with a bounded timeout that grows on every round
//! (see [WriterBackoff]) and re-checks the word.
//!
//! That's a trade-off, not an oversight: read unlocks stay cheap, but under a steady stream of readers a
//! writer may starve for a while. Waking on the last reader's unlock would change that balance.

use std::{
    fmt,
    sync::atomic::{
        AtomicI32, AtomicU32,
        Ordering::{Acquire, Relaxed, SeqCst},
    },
    time::{Duration, Instant},
};

use crate::{
    base::{BaseLock, Lockable, Owner, DEBUG_LOCKING},
    fatal, fatal_or_warn, futex,
    level::LockLevel,
    thread::ThreadContext,
};

/// Poll interval of a writer waiting for readers to leave: starts tiny, doubles up to a cap
struct WriterBackoff {
    next: Duration,
}

impl WriterBackoff {
    const FIRST: Duration = Duration::from_micros(1);
    const MAX: Duration = Duration::from_millis(1);

    fn new() -> Self {
        Self { next: Self::FIRST }
    }

    fn next(&mut self) -> Duration {
        let current = self.next;
        self.next = (current * 2).min(Self::MAX);
        current
    }
}

pub struct ReaderWriterMutex {
    base: BaseLock,
    /// -1 - exclusive, 0 - free, N - readers; the futex word
    state: AtomicI32,
    /// only meaningful while state == -1
    exclusive_owner: AtomicU32,
    num_pending_readers: AtomicI32,
    num_pending_writers: AtomicI32,
}

impl ReaderWriterMutex {
    pub fn new(name: &'static str, level: LockLevel) -> Self {
        Self {
            base: BaseLock::new(name, level),
            state: AtomicI32::new(0),
            exclusive_owner: AtomicU32::new(0),
            num_pending_readers: AtomicI32::new(0),
            num_pending_writers: AtomicI32::new(0),
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

    /// Blocks until the lock is held exclusively by the thread
    pub fn lock_exclusive<T: ThreadContext + ?Sized>(&self, thread: &T) {
        self.assert_not_exclusive_held(thread);
        self.base.check_acquire(thread);
        let mut backoff = WriterBackoff::new();
        loop {
            let cur_state = self.state.load(Relaxed);
            if cur_state == 0 {
                if self
                    .state
                    .compare_exchange_weak(0, -1, Acquire, Relaxed)
                    .is_ok()
                {
                    break;
                }
            } else {
                self.wait_as_writer(thread, cur_state, None, &mut backoff);
            }
        }
        self.exclusive_owner.store(thread.tid(), Relaxed);
        self.base.register_as_locked(thread);
    }

    /// Same as [Self::lock_exclusive] but gives up at `deadline`. Returns whether the lock was taken.
    /// Every wake recomputes the remaining time, spurious ones included.
    pub fn lock_exclusive_timed<T: ThreadContext + ?Sized>(&self, thread: &T, deadline: Instant) -> bool {
        self.assert_not_exclusive_held(thread);
        self.base.check_acquire(thread);
        let mut backoff = WriterBackoff::new();
        loop {
            let cur_state = self.state.load(Relaxed);
            if cur_state == 0 {
                if self
                    .state
                    .compare_exchange_weak(0, -1, Acquire, Relaxed)
                    .is_ok()
                {
                    break;
                }
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.wait_as_writer(thread, cur_state, Some(deadline - now), &mut backoff);
        }
        self.exclusive_owner.store(thread.tid(), Relaxed);
        self.base.register_as_locked(thread);
        true
    }

    #[cold]
    fn wait_as_writer<T: ThreadContext + ?Sized>(
        &self,
        thread: &T,
        cur_state: i32,
        limit: Option<Duration>,
        backoff: &mut WriterBackoff,
    ) {
        let _recorder = self
            .base
            .contention()
            .start(thread.tid(), self.exclusive_owner.load(Relaxed));
        self.num_pending_writers.fetch_add(1, SeqCst);
        self.base.respond_to_checkpoint(thread);
        // a writer inside wakes us on unlock, readers don't => poll while they're in
        let poll = (cur_state > 0).then(|| backoff.next());
        let timeout = match (poll, limit) {
            (Some(poll), Some(limit)) => Some(poll.min(limit)),
            (poll, limit) => poll.or(limit),
        };
        // a timeout is just another reason to look at the state word again
        if let Err(err) = futex::wait(&self.state, cur_state, timeout) {
            self.base.futex_failed("wait", err);
        }
        self.num_pending_writers.fetch_sub(1, SeqCst);
    }

    /// Releases the exclusive hold and wakes every waiter, readers and writers alike
    pub fn unlock_exclusive<T: ThreadContext + ?Sized>(&self, thread: &T) {
        self.base.assert_current(thread);
        if !self.is_exclusive_held(thread) {
            fatal!(
                "Unlocking \"{}\" exclusively by thread {} while the owner is {}",
                self.name(),
                thread.tid(),
                self.owner()
            );
        }
        self.base.register_as_unlocked(thread);
        loop {
            let cur_state = self.state.load(Relaxed);
            if cur_state != -1 {
                fatal!("Unexpected state {cur_state} in exclusive unlock for \"{}\"", self.name());
            }
            // we're no longer the owner
            self.exclusive_owner.store(0, Relaxed);
            // SeqCst: the pending counts below must not be read before the state word is released
            if self
                .state
                .compare_exchange_weak(-1, 0, SeqCst, Relaxed)
                .is_ok()
            {
                if self.num_pending_readers.load(SeqCst) > 0 || self.num_pending_writers.load(SeqCst) > 0 {
                    if let Err(err) = futex::wake_all(&self.state) {
                        self.base.futex_failed("wake", err);
                    }
                }
                return;
            }
        }
    }

    /// Blocks while a writer holds the lock, then joins the readers
    pub fn lock_shared<T: ThreadContext + ?Sized>(&self, thread: &T) {
        self.base.check_acquire(thread);
        loop {
            let cur_state = self.state.load(Relaxed);
            if cur_state >= 0 {
                // one more reader
                if self
                    .state
                    .compare_exchange_weak(cur_state, cur_state + 1, Acquire, Relaxed)
                    .is_ok()
                {
                    break;
                }
            } else {
                self.wait_as_reader(thread, cur_state);
            }
        }
        self.base.register_as_locked(thread);
    }

    #[cold]
    fn wait_as_reader<T: ThreadContext + ?Sized>(&self, thread: &T, cur_state: i32) {
        let _recorder = self
            .base
            .contention()
            .start(thread.tid(), self.exclusive_owner.load(Relaxed));
        self.num_pending_readers.fetch_add(1, SeqCst);
        self.base.respond_to_checkpoint(thread);
        if let Err(err) = futex::wait(&self.state, cur_state, None) {
            self.base.futex_failed("wait", err);
        }
        self.num_pending_readers.fetch_sub(1, SeqCst);
    }

    /// Never blocks, fails only while a writer holds the lock.
    /// The level order is only checked once the lock is taken.
    pub fn try_lock_shared<T: ThreadContext + ?Sized>(&self, thread: &T) -> bool {
        loop {
            let cur_state = self.state.load(Relaxed);
            if cur_state < 0 {
                return false;
            }
            if self
                .state
                .compare_exchange_weak(cur_state, cur_state + 1, Acquire, Relaxed)
                .is_ok()
            {
                break;
            }
        }
        self.base.check_acquire(thread);
        self.base.register_as_locked(thread);
        true
    }

    /// Leaves the readers. Wakes nobody, see the module docs.
    pub fn unlock_shared<T: ThreadContext + ?Sized>(&self, thread: &T) {
        self.base.assert_current(thread);
        self.base.register_as_unlocked(thread);
        loop {
            let cur_state = self.state.load(Relaxed);
            if cur_state <= 0 {
                fatal!("Unexpected state {cur_state} in shared unlock for \"{}\"", self.name());
            }
            if self
                .state
                .compare_exchange_weak(cur_state, cur_state - 1, SeqCst, Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn is_exclusive_held<T: ThreadContext + ?Sized>(&self, thread: &T) -> bool {
        let held = self.exclusive_owner.load(Relaxed) == thread.tid();
        if DEBUG_LOCKING
            && held
            && !std::thread::panicking()
            && thread.held_lock(self.level()) != Some(self.base.handle())
        {
            fatal!("\"{}\" is owned by {} but missing from its held locks", self.name(), thread.tid());
        }
        held
    }

    /// Held either way by the thread. Only the thread's own answer is reliable, asking about another
    /// thread races with its lock and unlock calls.
    pub fn is_shared_held<T: ThreadContext + ?Sized>(&self, thread: &T) -> bool {
        thread.held_lock(self.level()) == Some(self.base.handle())
    }

    pub fn owner(&self) -> Owner {
        match self.state.load(Relaxed) {
            0 => Owner::Free,
            s if s > 0 => Owner::Shared,
            _ => Owner::Exclusive(self.exclusive_owner.load(Relaxed)),
        }
    }

    /// current number of readers, 0 when free or held by a writer
    pub fn num_readers(&self) -> i32 {
        self.state.load(Relaxed).max(0)
    }

    pub fn assert_exclusive_held<T: ThreadContext + ?Sized>(&self, thread: &T) {
        if DEBUG_LOCKING && !self.is_exclusive_held(thread) {
            fatal!("\"{}\" isn't held exclusively by thread {}", self.name(), thread.tid());
        }
    }

    pub fn assert_not_exclusive_held<T: ThreadContext + ?Sized>(&self, thread: &T) {
        if DEBUG_LOCKING && self.is_exclusive_held(thread) {
            fatal!("\"{}\" is unexpectedly held exclusively by thread {}", self.name(), thread.tid());
        }
    }

    pub fn assert_shared_held<T: ThreadContext + ?Sized>(&self, thread: &T) {
        if DEBUG_LOCKING && !self.is_shared_held(thread) {
            fatal!("\"{}\" isn't held by thread {}", self.name(), thread.tid());
        }
    }

    pub fn assert_not_held<T: ThreadContext + ?Sized>(&self, thread: &T) {
        if DEBUG_LOCKING && self.is_shared_held(thread) {
            fatal!("\"{}\" is unexpectedly held by thread {}", self.name(), thread.tid());
        }
    }

    /// Wakes every waiter without touching the lock, so they re-run their checkpoint check and block again
    pub fn wake_all_for_checkpoint(&self) {
        if DEBUG_LOCKING && !self.base.should_respond_to_checkpoint() {
            fatal!("\"{}\" doesn't respond to empty checkpoints", self.name());
        }
        self.wake_waiters();
    }

    fn wake_waiters(&self) {
        if self.num_pending_readers.load(Relaxed) > 0 || self.num_pending_writers.load(Relaxed) > 0 {
            if let Err(err) = futex::wake_all(&self.state) {
                self.base.futex_failed("wake", err);
            }
        }
    }
}

impl Lockable for ReaderWriterMutex {
    fn base(&self) -> &BaseLock {
        &self.base
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(
            out,
            "{} level={} owner={} state={} num_pending_writers={} num_pending_readers={} ",
            self.name(),
            self.level(),
            self.owner(),
            self.state.load(SeqCst),
            self.num_pending_writers.load(SeqCst),
            self.num_pending_readers.load(SeqCst)
        )?;
        self.base.contention().dump(out)
    }

    /// No flag check: the lock may have just left the weak reference list, an extra wake is harmless
    fn wakeup_to_respond_to_checkpoint(&self) {
        self.wake_waiters()
    }
}

impl fmt::Display for ReaderWriterMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dump(f)
    }
}

impl fmt::Debug for ReaderWriterMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dump(f)
    }
}

impl Drop for ReaderWriterMutex {
    fn drop(&mut self) {
        let state = *self.state.get_mut();
        if state != 0 {
            fatal_or_warn!(
                "destroying reader-writer mutex \"{}\" with owner or readers, state: {state}",
                self.name()
            );
        } else if *self.num_pending_readers.get_mut() != 0 || *self.num_pending_writers.get_mut() != 0 {
            fatal_or_warn!("unexpectedly found waiters on reader-writer mutex \"{}\"", self.name());
        }
    }
}

/// Holds the lock shared for its lifetime
pub struct ReaderMutexLock<'a, T: ThreadContext + ?Sized> {
    mutex: &'a ReaderWriterMutex,
    thread: &'a T,
}

impl<'a, T: ThreadContext + ?Sized> ReaderMutexLock<'a, T> {
    pub fn new(thread: &'a T, mutex: &'a ReaderWriterMutex) -> Self {
        mutex.lock_shared(thread);
        Self { mutex, thread }
    }
}

impl<T: ThreadContext + ?Sized> Drop for ReaderMutexLock<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock_shared(self.thread);
    }
}

/// Holds the lock exclusively for its lifetime
pub struct WriterMutexLock<'a, T: ThreadContext + ?Sized> {
    mutex: &'a ReaderWriterMutex,
    thread: &'a T,
}

impl<'a, T: ThreadContext + ?Sized> WriterMutexLock<'a, T> {
    pub fn new(thread: &'a T, mutex: &'a ReaderWriterMutex) -> Self {
        mutex.lock_exclusive(thread);
        Self { mutex, thread }
    }
}

impl<T: ThreadContext + ?Sized> Drop for WriterMutexLock<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock_exclusive(self.thread);
    }
}
