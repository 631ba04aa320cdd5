//! # Mutator mutex
//!
//! A [ReaderWriterMutex] whose shared side means "this thread is runnable and may touch the managed heap".
//! Threads don't lock it shared like a regular lock. They enter the shared state when they turn runnable
//! and leave it when they suspend. Taking it exclusively then guarantees that every other thread is
//! suspended.
//!
//! Only the code that owns the thread state machine may do that, so none of the raw operations are
//! public. Each of them takes a [MutatorKey], and there's exactly one key per registry,
//! handed out by [Locks::take_mutator_key](crate::Locks::take_mutator_key).
//! Everybody else gets the queries and the assertions.

use std::{fmt, time::Instant};

use crate::{
    base::{BaseLock, Lockable, Owner},
    level::LockLevel,
    sync::rw_mutex::ReaderWriterMutex,
    thread::ThreadContext,
};

/// Proof of being the thread state machine. Not `Clone`, can't be built outside of the crate.
#[derive(Debug)]
pub struct MutatorKey {
    _private: (),
}

impl MutatorKey {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

pub struct MutatorMutex {
    inner: ReaderWriterMutex,
}

impl MutatorMutex {
    pub(crate) fn new(name: &'static str, level: LockLevel) -> Self {
        Self {
            inner: ReaderWriterMutex::new(name, level),
        }
    }

    pub fn base(&self) -> &BaseLock {
        self.inner.base()
    }

    pub fn name(&self) -> &'static str {
        self.inner.name()
    }

    pub fn level(&self) -> LockLevel {
        self.inner.level()
    }

    /// The thread becomes runnable: joins the shared holders, blocking while somebody holds it exclusively
    pub fn transition_from_suspended_to_runnable<T: ThreadContext + ?Sized>(&self, _key: &MutatorKey, thread: &T) {
        self.inner.lock_shared(thread)
    }

    /// The thread suspends: leaves the shared holders
    pub fn transition_from_runnable_to_suspended<T: ThreadContext + ?Sized>(&self, _key: &MutatorKey, thread: &T) {
        self.inner.unlock_shared(thread)
    }

    /// Suspends the world: returns once no thread is runnable
    pub fn exclusive_lock<T: ThreadContext + ?Sized>(&self, _key: &MutatorKey, thread: &T) {
        self.inner.lock_exclusive(thread)
    }

    pub fn exclusive_lock_timed<T: ThreadContext + ?Sized>(
        &self,
        _key: &MutatorKey,
        thread: &T,
        deadline: Instant,
    ) -> bool {
        self.inner.lock_exclusive_timed(thread, deadline)
    }

    pub fn exclusive_unlock<T: ThreadContext + ?Sized>(&self, _key: &MutatorKey, thread: &T) {
        self.inner.unlock_exclusive(thread)
    }

    pub fn is_exclusive_held<T: ThreadContext + ?Sized>(&self, thread: &T) -> bool {
        self.inner.is_exclusive_held(thread)
    }

    pub fn is_shared_held<T: ThreadContext + ?Sized>(&self, thread: &T) -> bool {
        self.inner.is_shared_held(thread)
    }

    pub fn owner(&self) -> Owner {
        self.inner.owner()
    }

    pub fn assert_exclusive_held<T: ThreadContext + ?Sized>(&self, thread: &T) {
        self.inner.assert_exclusive_held(thread)
    }

    pub fn assert_shared_held<T: ThreadContext + ?Sized>(&self, thread: &T) {
        self.inner.assert_shared_held(thread)
    }

    pub fn assert_not_held<T: ThreadContext + ?Sized>(&self, thread: &T) {
        self.inner.assert_not_held(thread)
    }

    pub fn assert_not_exclusive_held<T: ThreadContext + ?Sized>(&self, thread: &T) {
        self.inner.assert_not_exclusive_held(thread)
    }
}

impl Lockable for MutatorMutex {
    fn base(&self) -> &BaseLock {
        self.inner.base()
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.inner.dump(out)
    }

    fn wakeup_to_respond_to_checkpoint(&self) {
        self.inner.wakeup_to_respond_to_checkpoint()
    }
}

impl fmt::Display for MutatorMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dump(f)
    }
}

impl fmt::Debug for MutatorMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dump(f)
    }
}

/// Keeps the thread runnable for its lifetime
pub struct ScopedRunnable<'a, T: ThreadContext + ?Sized> {
    mutex: &'a MutatorMutex,
    key: &'a MutatorKey,
    thread: &'a T,
}

impl<'a, T: ThreadContext + ?Sized> ScopedRunnable<'a, T> {
    pub fn new(key: &'a MutatorKey, thread: &'a T, mutex: &'a MutatorMutex) -> Self {
        mutex.transition_from_suspended_to_runnable(key, thread);
        Self { mutex, key, thread }
    }
}

impl<T: ThreadContext + ?Sized> Drop for ScopedRunnable<'_, T> {
    fn drop(&mut self) {
        self.mutex.transition_from_runnable_to_suspended(self.key, self.thread);
    }
}
