//! # Base lock
//!
//! State every lock kind shares: a name, a [LockLevel] fixed at construction, the "respond to empty
//! checkpoint" flag and the contention ledger.
//!
//! It also owns the bookkeeping against the thread's held lock table:
//! - [BaseLock::check_acquire] - the level order check, before a thread tries to take the lock
//! - [BaseLock::register_as_locked] / [BaseLock::register_as_unlocked] - fill and clear the table slot
//! - [BaseLock::check_safe_to_wait] - a thread may only wait on a condition while holding its guard alone
//!
//! The checks only run with debug locking (debug builds or the `debug-locking` feature).

use std::{
    fmt, io,
    sync::atomic::{AtomicBool, Ordering::Relaxed},
};

use crate::{
    contention::ContentionLog,
    fatal,
    level::LockLevel,
    locks::Locks,
    thread::{LockHandle, ThreadContext, Tid},
};

/// Whether ordering, ownership and recursion checks run at all
pub const DEBUG_LOCKING: bool = cfg!(any(debug_assertions, feature = "debug-locking"));

/// Whether the contention ledger records anything
pub const LOG_LOCK_CONTENTIONS: bool = cfg!(feature = "contention-log");

/// Who holds a lock, as far as a dump is concerned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    Free,
    /// held by one or more readers, nobody in particular
    Shared,
    Exclusive(Tid),
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Free => write!(f, "0"),
            Owner::Shared => write!(f, "-1"),
            Owner::Exclusive(tid) => write!(f, "{tid}"),
        }
    }
}

pub struct BaseLock {
    name: &'static str,
    level: LockLevel,
    respond_to_checkpoint: AtomicBool,
    contention: ContentionLog,
}

impl BaseLock {
    pub(crate) fn new(name: &'static str, level: LockLevel) -> Self {
        Self {
            name,
            level,
            respond_to_checkpoint: AtomicBool::new(false),
            contention: ContentionLog::new(name, level),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    pub fn handle(&self) -> LockHandle {
        LockHandle::of(self)
    }

    pub fn contention(&self) -> &ContentionLog {
        &self.contention
    }

    pub fn should_respond_to_checkpoint(&self) -> bool {
        self.respond_to_checkpoint.load(Relaxed)
    }

    pub(crate) fn set_should_respond_to_checkpoint(&self, respond: bool) {
        self.respond_to_checkpoint.store(respond, Relaxed);
    }

    /// Runs the thread's pending empty checkpoint if this lock is flagged for it.
    /// Called on the contention path, right before blocking.
    pub(crate) fn respond_to_checkpoint<T: ThreadContext + ?Sized>(&self, thread: &T) {
        if self.should_respond_to_checkpoint() {
            thread.check_empty_checkpoint_from_mutex();
        }
    }

    pub(crate) fn assert_current<T: ThreadContext + ?Sized>(&self, thread: &T) {
        if DEBUG_LOCKING && !thread.is_current() {
            fatal!("thread {} used from another OS thread on \"{}\"", thread.tid(), self.name);
        }
    }

    /// The level order check: the thread must hold nothing at this lock's level or below.
    ///
    /// Exceptions around the top level:
    /// - a top level lock can't be taken with the mutator lock held shared, exclusive is fine
    /// - the mutator lock can't be taken while holding a top level lock
    /// - a top level lock may be taken while holding the user code suspension lock,
    ///   unless the thread is being suspended for user code
    ///
    /// Holding something below [LockLevel::Abort] is only reported, never fatal. Holding the abort lock
    /// itself isn't even reported.
    pub(crate) fn check_acquire<T: ThreadContext + ?Sized>(&self, thread: &T) {
        if !DEBUG_LOCKING {
            return;
        }
        self.assert_current(thread);
        let locks = Locks::get();
        let mut bad_locks_held = false;

        if let Some(locks) = locks {
            let mutator = locks.mutator_lock;
            if self.level == LockLevel::TopLockLevel
                && mutator.is_shared_held(thread)
                && !mutator.is_exclusive_held(thread)
            {
                log::error!(
                    "Lock level violation: holding \"{}\" (level {}) non-exclusive while locking \"{}\" (level {}), a top level lock",
                    mutator.name(),
                    LockLevel::Mutator,
                    self.name,
                    self.level
                );
                bad_locks_held = true;
            } else if self.handle() == mutator.base().handle() {
                if let Some(top) = thread.held_lock(LockLevel::TopLockLevel) {
                    log::error!(
                        "Lock level violation: locking \"{}\" while holding top level lock \"{}\"",
                        self.name,
                        top.name()
                    );
                    bad_locks_held = true;
                }
            }
        }

        let mutator_exclusive = locks.is_some_and(|l| l.mutator_lock.is_exclusive_held(thread));
        let user_code_suspension = locks.map(|l| l.user_code_suspension_lock.base().handle());
        for level in self.level.this_and_below() {
            let Some(held) = thread.held_lock(level) else {
                continue;
            };
            if level == LockLevel::Abort
                || (self.level == LockLevel::TopLockLevel && level == LockLevel::Mutator && mutator_exclusive)
            {
                // the abort lock may be held by anyone, the exclusive mutator case is checked above
                continue;
            }
            if self.level == LockLevel::TopLockLevel
                && level == LockLevel::UserCodeSuspension
                && Some(held) == user_code_suspension
            {
                if thread.is_suspending_for_user_code() {
                    log::error!(
                        "Holding \"{}\" (level {}) while locking \"{}\" (level {}) with user code suspensions pending",
                        held.name(),
                        level,
                        self.name,
                        self.level
                    );
                    bad_locks_held = true;
                }
            } else {
                log::error!(
                    "Lock level violation: holding \"{}\" (level {} - {}) while locking \"{}\" (level {} - {})",
                    held.name(),
                    level,
                    level.index(),
                    self.name,
                    self.level,
                    self.level.index()
                );
                if level > LockLevel::Abort {
                    bad_locks_held = true;
                }
            }
        }

        if bad_locks_held && !std::thread::panicking() {
            fatal!("lock level violation acquiring \"{}\" (level {})", self.name, self.level);
        }
    }

    /// Fills the thread's held slot for this level. Monitors live outside of the level analysis.
    pub(crate) fn register_as_locked<T: ThreadContext + ?Sized>(&self, thread: &T) {
        if self.level != LockLevel::Monitor {
            thread.set_held_lock(self.level, Some(self.handle()));
        }
    }

    pub(crate) fn register_as_unlocked<T: ThreadContext + ?Sized>(&self, thread: &T) {
        if self.level == LockLevel::Monitor {
            return;
        }
        if DEBUG_LOCKING && thread.held_lock(self.level) != Some(self.handle()) {
            fatal!("Unlocking on unacquired mutex: \"{}\"", self.name);
        }
        thread.set_held_lock(self.level, None);
    }

    /// Before waiting on a condition guarded by this lock: the thread must hold this lock and nothing else.
    ///
    /// The one exception: waiting on a [LockLevel::ThreadSuspendCount] condition with the user code
    /// suspension lock held is fine, unless this very thread is being suspended for user code.
    pub(crate) fn check_safe_to_wait<T: ThreadContext + ?Sized>(&self, thread: &T) {
        if !DEBUG_LOCKING {
            return;
        }
        if self.level != LockLevel::Monitor && thread.held_lock(self.level) != Some(self.handle()) {
            fatal!("Waiting on unacquired mutex: \"{}\"", self.name);
        }
        let user_code_suspension = Locks::get().map(|l| l.user_code_suspension_lock.base().handle());
        let mut bad_locks_held = false;
        for level in LockLevel::TopLockLevel.this_and_below() {
            if level == self.level {
                continue;
            }
            let Some(held) = thread.held_lock(level) else {
                continue;
            };
            if Some(held) == user_code_suspension && self.level == LockLevel::ThreadSuspendCount {
                if thread.is_suspending_for_user_code() {
                    log::error!(
                        "Holding \"{}\" (level {}) while performing wait on \"{}\" (level {}) with user code suspensions pending",
                        held.name(),
                        level,
                        self.name,
                        self.level
                    );
                    bad_locks_held = true;
                }
            } else {
                log::error!(
                    "Holding \"{}\" (level {}) while performing wait on \"{}\" (level {})",
                    held.name(),
                    level,
                    self.name,
                    self.level
                );
                bad_locks_held = true;
            }
        }
        if bad_locks_held && !std::thread::panicking() {
            fatal!("unsafe wait on \"{}\"", self.name);
        }
    }

    /// Any futex error other than a spurious wake or a timeout means the lock word is garbage
    #[cold]
    pub(crate) fn futex_failed(&self, op: &str, err: io::Error) -> ! {
        fatal!("futex {op} failed for \"{}\": {err}", self.name)
    }
}

/// The dynamic face of every lock kind: naming, dumping, checkpoint wakeups.
/// Locking itself stays on the concrete types.
pub trait Lockable: Sync {
    fn base(&self) -> &BaseLock;

    fn name(&self) -> &'static str {
        self.base().name()
    }

    fn level(&self) -> LockLevel {
        self.base().level()
    }

    fn has_ever_contended(&self) -> bool {
        self.base().contention().has_ever_contended()
    }

    /// one line: name, level, depth or reader count, owner, contention
    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result;

    /// Wakes every thread blocked on the lock so the flagged ones run their pending checkpoint
    fn wakeup_to_respond_to_checkpoint(&self);
}
