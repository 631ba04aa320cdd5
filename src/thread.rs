//! # Thread capability
//!
//! The locks don't know what a thread is. They need a few things from whoever calls them:
//! - an identifier to record as the owner
//! - a table of the locks the thread holds, one slot per [LockLevel], to check the level order
//! - a way to run a pending empty checkpoint while blocked on a lock flagged for it
//!
//! That's [ThreadContext]. It's passed explicitly into every lock operation rather than looked up in a
//! thread local, so tests can fake as many "threads" as they like.
//!
//! [LockThread] is a ready-made implementation for code that has no thread object of its own.

use std::{
    cell::Cell,
    sync::{
        atomic::{
            AtomicU32,
            Ordering::{Relaxed, SeqCst},
        },
        Arc,
    },
    thread::ThreadId,
};

use strum::EnumCount;

use crate::{base::BaseLock, checkpoint::CheckpointSlot, level::LockLevel};

/// Thread identifier, 0 means "nobody"
pub type Tid = u32;

/// Identity of a lock as recorded in a held lock table. It's never dereferenced, so it stays valid
/// (as a value) even after the lock is gone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockHandle {
    addr: usize,
    name: &'static str,
    level: LockLevel,
}

impl LockHandle {
    pub(crate) fn of(lock: &BaseLock) -> Self {
        Self {
            addr: lock as *const BaseLock as usize,
            name: lock.name(),
            level: lock.level(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }
}

/// What a lock needs from the thread calling it
pub trait ThreadContext {
    fn tid(&self) -> Tid;

    /// is this the thread the object belongs to
    fn is_current(&self) -> bool {
        true
    }

    fn held_lock(&self, level: LockLevel) -> Option<LockHandle>;

    fn set_held_lock(&self, level: LockLevel, lock: Option<LockHandle>);

    /// Called by a thread about to block on a lock that responds to empty checkpoints.
    fn check_empty_checkpoint_from_mutex(&self) {}

    /// is somebody suspending this thread on behalf of user code
    fn is_suspending_for_user_code(&self) -> bool {
        false
    }
}

/// Per-thread table of held locks, one slot per level
pub struct HeldLocks {
    slots: [Cell<Option<LockHandle>>; LockLevel::COUNT],
}

impl HeldLocks {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Cell::new(None)),
        }
    }

    pub fn get(&self, level: LockLevel) -> Option<LockHandle> {
        self.slots[level.index()].get()
    }

    pub fn set(&self, level: LockLevel, lock: Option<LockHandle>) {
        self.slots[level.index()].set(lock)
    }

    /// number of occupied slots
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.get().is_some()).count()
    }
}

impl Default for HeldLocks {
    fn default() -> Self {
        Self::new()
    }
}

static NEXT_TID: AtomicU32 = AtomicU32::new(1);

/// A [ThreadContext] of its own for an OS thread.
/// It's !Sync on purpose: only the thread it's attached to may touch its held lock table.
pub struct LockThread {
    tid: Tid,
    os_thread: ThreadId,
    held: HeldLocks,
    checkpoint: Arc<CheckpointSlot>,
    user_code_suspend_count: AtomicU32,
}

impl LockThread {
    /// Creates the context for the calling OS thread
    pub fn attach() -> Self {
        Self::attach_with_checkpoint(Arc::new(CheckpointSlot::new()))
    }

    /// Same as [Self::attach], with a checkpoint slot the requester got hold of beforehand
    pub fn attach_with_checkpoint(checkpoint: Arc<CheckpointSlot>) -> Self {
        Self {
            tid: NEXT_TID.fetch_add(1, Relaxed),
            os_thread: std::thread::current().id(),
            held: HeldLocks::new(),
            checkpoint,
            user_code_suspend_count: AtomicU32::new(0),
        }
    }

    /// The slot other threads use to request an empty checkpoint from this one
    pub fn checkpoint_slot(&self) -> Arc<CheckpointSlot> {
        Arc::clone(&self.checkpoint)
    }

    pub fn number_of_held_locks(&self) -> usize {
        self.held.count()
    }

    pub fn set_user_code_suspend_count(&self, count: u32) {
        self.user_code_suspend_count.store(count, SeqCst);
    }
}

impl ThreadContext for LockThread {
    fn tid(&self) -> Tid {
        self.tid
    }

    fn is_current(&self) -> bool {
        self.os_thread == std::thread::current().id()
    }

    fn held_lock(&self, level: LockLevel) -> Option<LockHandle> {
        self.held.get(level)
    }

    fn set_held_lock(&self, level: LockLevel, lock: Option<LockHandle>) {
        self.held.set(level, lock)
    }

    fn check_empty_checkpoint_from_mutex(&self) {
        self.checkpoint.run_if_pending(self);
    }

    fn is_suspending_for_user_code(&self) -> bool {
        self.user_code_suspend_count.load(SeqCst) != 0
    }
}
