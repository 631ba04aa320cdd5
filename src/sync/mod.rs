//! The lock kinds and what's built on top of them

pub mod barrier;
pub mod condvar;
pub mod mutator;
pub mod mutex;
pub mod rw_mutex;

pub use barrier::Barrier;
pub use condvar::ConditionVariable;
pub use mutator::{MutatorKey, MutatorMutex, ScopedRunnable};
pub use mutex::{Mutex, MutexLock};
pub use rw_mutex::{ReaderMutexLock, ReaderWriterMutex, WriterMutexLock};
