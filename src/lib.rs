//! # Runtime locks
//!
//! Futex-based locks for a managed runtime: an exclusive [Mutex], a [ReaderWriterMutex], the
//! [MutatorMutex] whose shared side is the "thread is runnable" state, and a [ConditionVariable] bound to
//! one mutex.
//!
//! On top of plain locking they do what a runtime needs to stay debuggable:
//! - every lock has a [LockLevel] and, with debug locking, a thread may only acquire downwards
//! - contended locks keep a small, racy contention ledger ([dump_all])
//! - threads blocked on selected locks still answer empty checkpoints ([Locks::run_empty_checkpoint])
//!
//! The process-wide named locks live in the [Locks] registry.
//!
//! Locks don't look the current thread up, callers pass a [ThreadContext] into every operation.

pub mod abort;
pub mod base;
pub mod checkpoint;
pub mod contention;
pub mod futex;
pub mod level;
pub mod locks;
pub mod spin;
pub mod sync;
pub mod thread;

pub use abort::{is_safe_to_abort, set_abort_policy};
pub use base::{BaseLock, Lockable, Owner, DEBUG_LOCKING, LOG_LOCK_CONTENTIONS};
pub use checkpoint::CheckpointSlot;
pub use contention::{dump_all, ContentionLog};
pub use level::LockLevel;
pub use locks::{LockError, Locks};
pub use sync::{
    Barrier, ConditionVariable, MutatorKey, MutatorMutex, Mutex, MutexLock, ReaderMutexLock, ReaderWriterMutex,
    ScopedRunnable, WriterMutexLock,
};
pub use thread::{HeldLocks, LockHandle, LockThread, ThreadContext, Tid};
